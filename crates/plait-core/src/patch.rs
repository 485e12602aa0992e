//! Patches: the observable delta between two document states.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::change::ChangeHash;
use crate::identity::{ActorId, ObjId, OpId};
use crate::value::{ObjType, ScalarValue};

/// A diff node. Map entries and list edits are authoritative: they carry
/// the full new active set for every slot they mention, so applying them
/// replaces rather than merges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diff {
    Map(MapDiff),
    Seq(SeqDiff),
    Value { value: ScalarValue },
}

impl Diff {
    pub fn value(value: ScalarValue) -> Self {
        Diff::Value { value }
    }
}

/// Per-key conflict sets for a map or table. An empty entry means every
/// assignment at that key was overridden: the key disappears, and the
/// empty diff is still emitted so observers drop their view of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapDiff {
    pub object_id: ObjId,
    pub obj_type: ObjType,
    pub props: BTreeMap<String, BTreeMap<OpId, Diff>>,
}

impl MapDiff {
    pub fn new(object_id: ObjId, obj_type: ObjType) -> Self {
        MapDiff {
            object_id,
            obj_type,
            props: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }
}

/// Ordered edits for a list or text object. Indices refer to positions in
/// the post-edit list at the point each edit is applied, in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeqDiff {
    pub object_id: ObjId,
    pub obj_type: ObjType,
    pub edits: Vec<Edit>,
}

impl SeqDiff {
    pub fn new(object_id: ObjId, obj_type: ObjType) -> Self {
        SeqDiff {
            object_id,
            obj_type,
            edits: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Edit {
    /// A new element at `index` with elemId `elem_id`. `values` may be
    /// empty when the element was deleted later in the same batch; a
    /// subsequent `remove` always follows such a placeholder.
    Insert {
        index: usize,
        elem_id: OpId,
        values: BTreeMap<OpId, Diff>,
    },
    /// A run of elements with consecutive elemIds starting at `elem_id`,
    /// one primitive value each. Semantically equivalent to the expanded
    /// inserts.
    MultiInsert {
        index: usize,
        elem_id: OpId,
        values: Vec<ScalarValue>,
    },
    /// Replace the conflict set of the element at `index`.
    Update {
        index: usize,
        values: BTreeMap<OpId, Diff>,
    },
    /// Remove `count` elements starting at `index`.
    Remove { index: usize, count: usize },
}

/// The delta produced by applying a batch of changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Set when this patch confirms a local change.
    pub actor: Option<ActorId>,
    pub seq: Option<u64>,
    /// Heads after the batch, sorted.
    pub deps: Vec<ChangeHash>,
    /// Greatest op counter applied so far.
    pub max_op: u64,
    /// Depth of the pending (parked) queue after the batch.
    pub pending_changes: usize,
    /// Root diff; empty when the batch changed nothing observable.
    pub diffs: MapDiff,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }
}
