//! The frontend snapshot: an object table rebuilt purely from patches.
//!
//! The snapshot never sees ops; it mirrors whatever the engine reports.
//! Map entries and list edits in a patch are authoritative, so applying a
//! patch replaces slots wholesale.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::change::ChangeHash;
use crate::error::BackendError;
use crate::identity::{ActorId, ObjId, OpId};
use crate::patch::{Diff, Edit, MapDiff, Patch, SeqDiff};
use crate::value::{ObjType, ScalarValue};

/// A user-visible value: the projection of one assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Object(ObjId, ObjType),
    Scalar(ScalarValue),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Slot {
    Scalar(ScalarValue),
    Object(ObjId),
}

pub(crate) type Conflicts = BTreeMap<OpId, Slot>;

#[derive(Clone, Debug)]
pub(crate) struct DocObject {
    pub(crate) obj_type: ObjType,
    pub(crate) props: BTreeMap<String, Conflicts>,
    pub(crate) elems: Vec<(OpId, Conflicts)>,
}

impl DocObject {
    pub(crate) fn new(obj_type: ObjType) -> Self {
        DocObject {
            obj_type,
            props: BTreeMap::new(),
            elems: Vec::new(),
        }
    }
}

/// One replica's immutable-feeling view of a document. Interior state only
/// changes through `apply_patch`.
#[derive(Clone, Debug)]
pub struct Doc {
    actor: ActorId,
    seq: u64,
    max_op: u64,
    heads: Vec<ChangeHash>,
    in_flight: VecDeque<u64>,
    objects: BTreeMap<ObjId, DocObject>,
}

impl Doc {
    pub fn new() -> Self {
        Doc::with_actor(ActorId::random())
    }

    pub fn with_actor(actor: ActorId) -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(ObjId::Root, DocObject::new(ObjType::Map));
        Doc {
            actor,
            seq: 0,
            max_op: 0,
            heads: Vec::new(),
            in_flight: VecDeque::new(),
            objects,
        }
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor
    }

    /// Replace the actor id; only legal before the first local change.
    pub fn set_actor_id(&mut self, actor: ActorId) -> Result<(), BackendError> {
        if self.seq > 0 {
            return Err(BackendError::StateMismatch {
                reason: "actor id can only change before the first local change".into(),
            });
        }
        self.actor = actor;
        Ok(())
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn max_op(&self) -> u64 {
        self.max_op
    }

    pub fn heads(&self) -> &[ChangeHash] {
        &self.heads
    }

    pub(crate) fn note_local_change(&mut self, seq: u64, claimed_ops: u64) {
        self.seq = seq;
        self.max_op += claimed_ops;
        self.in_flight.push_back(seq);
    }

    /// Merge a patch from the engine. A patch confirming a local change
    /// must match the oldest in-flight seq, else the snapshot and engine
    /// have diverged.
    pub fn apply_patch(&mut self, patch: &Patch) -> Result<(), BackendError> {
        if patch.actor.as_ref() == Some(&self.actor) {
            match self.in_flight.front() {
                Some(expected) if patch.seq == Some(*expected) => {
                    self.in_flight.pop_front();
                }
                _ => {
                    return Err(BackendError::StateMismatch {
                        reason: format!(
                            "patch confirms seq {:?} but in-flight front is {:?}",
                            patch.seq,
                            self.in_flight.front()
                        ),
                    })
                }
            }
        }
        self.apply_map_diff(&patch.diffs)?;
        self.heads = patch.deps.clone();
        self.max_op = self.max_op.max(patch.max_op);
        Ok(())
    }

    fn apply_diff(&mut self, diff: &Diff) -> Result<Slot, BackendError> {
        match diff {
            Diff::Value { value } => Ok(Slot::Scalar(value.clone())),
            Diff::Map(map_diff) => {
                self.apply_map_diff(map_diff)?;
                Ok(Slot::Object(map_diff.object_id.clone()))
            }
            Diff::Seq(seq_diff) => {
                self.apply_seq_diff(seq_diff)?;
                Ok(Slot::Object(seq_diff.object_id.clone()))
            }
        }
    }

    fn apply_map_diff(&mut self, diff: &MapDiff) -> Result<(), BackendError> {
        self.objects
            .entry(diff.object_id.clone())
            .or_insert_with(|| DocObject::new(diff.obj_type));
        for (key, entry) in &diff.props {
            let mut conflicts = Conflicts::new();
            for (op_id, nested) in entry {
                conflicts.insert(op_id.clone(), self.apply_diff(nested)?);
            }
            let object = self
                .objects
                .get_mut(&diff.object_id)
                .expect("object inserted above");
            if conflicts.is_empty() {
                object.props.remove(key);
            } else {
                object.props.insert(key.clone(), conflicts);
            }
        }
        Ok(())
    }

    fn apply_seq_diff(&mut self, diff: &SeqDiff) -> Result<(), BackendError> {
        self.objects
            .entry(diff.object_id.clone())
            .or_insert_with(|| DocObject::new(diff.obj_type));
        for edit in &diff.edits {
            match edit {
                Edit::Insert {
                    index,
                    elem_id,
                    values,
                } => {
                    let mut conflicts = Conflicts::new();
                    for (op_id, nested) in values {
                        conflicts.insert(op_id.clone(), self.apply_diff(nested)?);
                    }
                    let object = self.object_mut(&diff.object_id)?;
                    if *index > object.elems.len() {
                        return Err(edit_out_of_bounds(&diff.object_id, *index));
                    }
                    object.elems.insert(*index, (elem_id.clone(), conflicts));
                }
                Edit::MultiInsert {
                    index,
                    elem_id,
                    values,
                } => {
                    let object = self.object_mut(&diff.object_id)?;
                    if *index > object.elems.len() {
                        return Err(edit_out_of_bounds(&diff.object_id, *index));
                    }
                    for (offset, value) in values.iter().enumerate() {
                        let id = OpId::new(
                            elem_id.counter + offset as u64,
                            elem_id.actor.clone(),
                        );
                        let conflicts =
                            Conflicts::from([(id.clone(), Slot::Scalar(value.clone()))]);
                        object.elems.insert(index + offset, (id, conflicts));
                    }
                }
                Edit::Update { index, values } => {
                    let mut conflicts = Conflicts::new();
                    for (op_id, nested) in values {
                        conflicts.insert(op_id.clone(), self.apply_diff(nested)?);
                    }
                    let object = self.object_mut(&diff.object_id)?;
                    match object.elems.get_mut(*index) {
                        Some((_, slot)) => *slot = conflicts,
                        None => return Err(edit_out_of_bounds(&diff.object_id, *index)),
                    }
                }
                Edit::Remove { index, count } => {
                    let (index, count) = (*index, *count);
                    let object = self.object_mut(&diff.object_id)?;
                    if index + count > object.elems.len() {
                        return Err(edit_out_of_bounds(&diff.object_id, index));
                    }
                    object.elems.drain(index..index + count);
                }
            }
        }
        Ok(())
    }

    fn object_mut(&mut self, obj: &ObjId) -> Result<&mut DocObject, BackendError> {
        self.objects
            .get_mut(obj)
            .ok_or_else(|| BackendError::StateMismatch {
                reason: format!("patch references unknown object {obj}"),
            })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn contains_object(&self, obj: &ObjId) -> bool {
        self.objects.contains_key(obj)
    }

    pub fn object_type(&self, obj: &ObjId) -> Option<ObjType> {
        self.objects.get(obj).map(|o| o.obj_type)
    }

    /// The visible value at a map key: the greatest-OpId assignment.
    pub fn get(&self, obj: &ObjId, key: &str) -> Option<Value> {
        self.objects
            .get(obj)
            .and_then(|o| o.props.get(key))
            .and_then(|conflicts| conflicts.iter().next_back())
            .map(|(_, slot)| self.project(slot))
    }

    /// The visible value at a list index.
    pub fn get_index(&self, obj: &ObjId, index: usize) -> Option<Value> {
        self.objects
            .get(obj)
            .and_then(|o| o.elems.get(index))
            .and_then(|(_, conflicts)| conflicts.iter().next_back())
            .map(|(_, slot)| self.project(slot))
    }

    /// Every concurrently-active assignment at a map key.
    pub fn get_conflicts(&self, obj: &ObjId, key: &str) -> BTreeMap<OpId, Value> {
        self.objects
            .get(obj)
            .and_then(|o| o.props.get(key))
            .map(|conflicts| {
                conflicts
                    .iter()
                    .map(|(op_id, slot)| (op_id.clone(), self.project(slot)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The object id assigned at a map key, if the visible value is one.
    pub fn get_object_id(&self, obj: &ObjId, key: &str) -> Option<ObjId> {
        match self.get(obj, key)? {
            Value::Object(id, _) => Some(id),
            Value::Scalar(_) => None,
        }
    }

    pub fn keys(&self, obj: &ObjId) -> Vec<String> {
        self.objects
            .get(obj)
            .map(|o| o.props.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn length(&self, obj: &ObjId) -> usize {
        self.objects.get(obj).map_or(0, |o| {
            if o.obj_type.is_sequence() {
                o.elems.len()
            } else {
                o.props.len()
            }
        })
    }

    /// Element id at a list index; what a transaction inserts after.
    pub fn elem_id_at(&self, obj: &ObjId, index: usize) -> Option<OpId> {
        self.objects
            .get(obj)
            .and_then(|o| o.elems.get(index))
            .map(|(elem_id, _)| elem_id.clone())
    }

    /// A Text object rendered as a string; the visible value of each
    /// element contributes its characters.
    pub fn text(&self, obj: &ObjId) -> Option<String> {
        let object = self.objects.get(obj)?;
        if object.obj_type != ObjType::Text {
            return None;
        }
        let mut out = String::new();
        for (_, conflicts) in &object.elems {
            if let Some((_, Slot::Scalar(ScalarValue::Str(s)))) = conflicts.iter().next_back() {
                out.push_str(s);
            }
        }
        Some(out)
    }

    fn project(&self, slot: &Slot) -> Value {
        match slot {
            Slot::Scalar(v) => Value::Scalar(v.clone()),
            Slot::Object(id) => {
                let obj_type = self
                    .objects
                    .get(id)
                    .map(|o| o.obj_type)
                    .unwrap_or(ObjType::Map);
                Value::Object(id.clone(), obj_type)
            }
        }
    }

    /// Snapshot of the object table, used as a transaction's overlay.
    pub(crate) fn clone_objects(&self) -> BTreeMap<ObjId, DocObject> {
        self.objects.clone()
    }
}

impl Default for Doc {
    fn default() -> Self {
        Doc::new()
    }
}

fn edit_out_of_bounds(obj: &ObjId, index: usize) -> BackendError {
    BackendError::StateMismatch {
        reason: format!("patch edit index {index} out of bounds in {obj}"),
    }
}
