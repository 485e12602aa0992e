//! The algebraic structure of operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{ElemId, Key, ObjId, OpId};
use crate::value::{ObjType, ScalarValue};

/// What an op does to its target slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    /// Create a composite object; the new object's id is this op's own id.
    Make(ObjType),
    /// Assign a primitive value.
    Set,
    /// Remove the assignments named in `pred` without adding one.
    Del,
    /// Add to the counter assignments named in `pred`.
    Inc,
    /// Assign a reference to an already-existing object.
    Link,
}

/// A single operation inside a change.
///
/// `pred` lists exactly the OpIds visibly assigning the same key/elemId when
/// the op was created on its origin replica, sorted ascending. Insertions
/// create fresh elements and therefore carry an empty `pred`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub action: OpType,
    pub obj: ObjId,
    pub key: Key,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insert: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pred: Vec<OpId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ScalarValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<OpId>,
    /// Run of consecutive primitive inserts sharing this op's base elemId;
    /// each element claims its own counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ScalarValue>>,
}

/// A structurally ill-formed op.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidOp {
    #[error("set op without a value")]
    SetWithoutValue,
    #[error("{action} op carries a value")]
    UnexpectedValue { action: &'static str },
    #[error("inc op value must be an integer")]
    NonIntegerIncrement,
    #[error("link op without a child")]
    LinkWithoutChild,
    #[error("multi-value run outside a list insertion")]
    MultiOutsideInsert,
    #[error("multi-value run with explicit pred")]
    MultiWithPred,
    #[error("empty multi-value run")]
    EmptyMulti,
    #[error("insertion keyed by a map key")]
    InsertAtMapKey,
    #[error("{action} op cannot be an insertion")]
    BadInsertAction { action: &'static str },
    #[error("map op keyed by an element id")]
    MapOpAtElem,
}

impl Op {
    pub fn set(obj: ObjId, key: Key, value: ScalarValue, pred: Vec<OpId>) -> Self {
        Op {
            action: OpType::Set,
            obj,
            key,
            insert: false,
            pred,
            value: Some(value),
            child: None,
            values: None,
        }
    }

    pub fn insert(obj: ObjId, after: ElemId, value: ScalarValue) -> Self {
        Op {
            action: OpType::Set,
            obj,
            key: Key::Elem(after),
            insert: true,
            pred: Vec::new(),
            value: Some(value),
            child: None,
            values: None,
        }
    }

    /// A run of consecutive primitive inserts after `after`.
    pub fn insert_many(obj: ObjId, after: ElemId, values: Vec<ScalarValue>) -> Self {
        Op {
            action: OpType::Set,
            obj,
            key: Key::Elem(after),
            insert: true,
            pred: Vec::new(),
            value: None,
            child: None,
            values: Some(values),
        }
    }

    pub fn del(obj: ObjId, key: Key, pred: Vec<OpId>) -> Self {
        Op {
            action: OpType::Del,
            obj,
            key,
            insert: false,
            pred,
            value: None,
            child: None,
            values: None,
        }
    }

    pub fn inc(obj: ObjId, key: Key, by: i64, pred: Vec<OpId>) -> Self {
        Op {
            action: OpType::Inc,
            obj,
            key,
            insert: false,
            pred,
            value: Some(ScalarValue::Int(by)),
            child: None,
            values: None,
        }
    }

    pub fn make(obj: ObjId, key: Key, obj_type: ObjType, insert: bool, pred: Vec<OpId>) -> Self {
        Op {
            action: OpType::Make(obj_type),
            obj,
            key,
            insert,
            pred,
            value: None,
            child: None,
            values: None,
        }
    }

    pub fn link(obj: ObjId, key: Key, child: OpId, pred: Vec<OpId>) -> Self {
        Op {
            action: OpType::Link,
            obj,
            key,
            insert: false,
            pred,
            value: None,
            child: Some(child),
            values: None,
        }
    }

    /// Number of op counters this op claims (1, or the run length).
    pub fn width(&self) -> u64 {
        match &self.values {
            Some(values) => values.len() as u64,
            None => 1,
        }
    }

    pub fn is_multi(&self) -> bool {
        self.values.is_some()
    }

    /// Structural validation, independent of any document state.
    pub fn validate(&self) -> Result<(), InvalidOp> {
        if let Some(values) = &self.values {
            if values.is_empty() {
                return Err(InvalidOp::EmptyMulti);
            }
            if !self.insert || self.action != OpType::Set {
                return Err(InvalidOp::MultiOutsideInsert);
            }
            if !self.pred.is_empty() {
                return Err(InvalidOp::MultiWithPred);
            }
        }
        if self.insert && matches!(self.key, Key::Map(_)) {
            return Err(InvalidOp::InsertAtMapKey);
        }
        if self.insert && matches!(self.action, OpType::Del | OpType::Inc) {
            let action = if self.action == OpType::Del { "del" } else { "inc" };
            return Err(InvalidOp::BadInsertAction { action });
        }
        match self.action {
            OpType::Set => {
                if self.value.is_none() && self.values.is_none() {
                    return Err(InvalidOp::SetWithoutValue);
                }
            }
            OpType::Del => {
                if self.value.is_some() {
                    return Err(InvalidOp::UnexpectedValue { action: "del" });
                }
            }
            OpType::Inc => match self.value {
                Some(ScalarValue::Int(_)) => {}
                _ => return Err(InvalidOp::NonIntegerIncrement),
            },
            OpType::Make(_) => {
                if self.value.is_some() {
                    return Err(InvalidOp::UnexpectedValue { action: "make" });
                }
            }
            OpType::Link => {
                if self.child.is_none() {
                    return Err(InvalidOp::LinkWithoutChild);
                }
            }
        }
        Ok(())
    }
}
