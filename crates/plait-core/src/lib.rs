//! plait engine core.
//!
//! Module hierarchy follows type dependency order:
//! - identity: ActorId, OpId, ObjId, ElemId, Key
//! - value: primitive value domain, object kinds
//! - op: operations
//! - change: hash-identified op batches
//! - codec: bit-exact columnar chunk encodings
//! - history: the causal DAG (heads, pending queue, reachability)
//! - opset: per-object CRDT state, deterministic application, patches
//! - backend: the engine facade
//! - doc / transaction / document: frontend snapshot and recorder

#![forbid(unsafe_code)]

pub mod backend;
pub mod change;
pub mod codec;
pub mod doc;
pub mod document;
pub mod error;
pub mod history;
pub mod identity;
pub mod limits;
pub mod op;
pub mod opset;
pub mod patch;
pub mod transaction;
pub mod value;

pub use backend::Backend;
pub use change::{sha256_bytes, Change, ChangeHash};
pub use codec::{decode_change, decode_document, encode_change, encode_document, DecodeError};
pub use doc::{Doc, Value};
pub use document::Document;
pub use error::{BackendError, InvalidId};
pub use history::{History, HistoryError, Inserted, StoredChange};
pub use identity::{ActorId, ElemId, Key, ObjId, OpId};
pub use limits::Limits;
pub use op::{InvalidOp, Op, OpType};
pub use opset::{ApplyError, OpSet};
pub use patch::{Diff, Edit, MapDiff, Patch, SeqDiff};
pub use transaction::{Transaction, TransactionError};
pub use value::{ObjType, ScalarValue};
