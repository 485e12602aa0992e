//! Shared error atoms (parsing, top-level backend errors).
//!
//! Layer-specific failures live beside their layer (`DecodeError` in the
//! codec, `HistoryError` in the DAG, `ApplyError` in the OpSet);
//! `BackendError` is the canonical enum callers match on.

use thiserror::Error;

use crate::change::ChangeHash;
use crate::codec::DecodeError;
use crate::history::HistoryError;
use crate::opset::ApplyError;
use crate::transaction::TransactionError;

/// Invalid identifier rendering.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("actor id `{raw}` is invalid: {reason}")]
    Actor { raw: String, reason: String },
    #[error("op id `{raw}` is invalid: {reason}")]
    Op { raw: String, reason: String },
    #[error("object id `{raw}` is invalid: {reason}")]
    Object { raw: String, reason: String },
    #[error("element id `{raw}` is invalid: {reason}")]
    Elem { raw: String, reason: String },
    #[error("change hash `{raw}` is invalid: {reason}")]
    Hash { raw: String, reason: String },
}

/// Canonical error enum for the engine facade.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// A strict operation was handed a change whose deps are unknown.
    #[error("missing dependency {missing} of change {change}")]
    MissingDependency {
        change: ChangeHash,
        missing: ChangeHash,
    },
    /// Two documents with the same actor id cannot be merged.
    #[error("actor collision: both documents use actor {actor}")]
    ActorCollision { actor: String },
    /// A patch does not correspond to the snapshot it was applied to.
    #[error("state mismatch: {reason}")]
    StateMismatch { reason: String },
}
