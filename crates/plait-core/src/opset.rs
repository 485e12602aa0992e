//! The OpSet: per-object CRDT state and deterministic op application.
//!
//! Maps and tables hold a set of concurrently-active assignments per key;
//! reads project the greatest OpId. Lists and texts hold elements with
//! stable elemIds, tombstoned in place when every assignment is removed.
//! Counters accumulate increments on the assignment they target.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::warn;

use crate::change::Change;
use crate::identity::{ElemId, Key, ObjId, OpId};
use crate::op::{InvalidOp, OpType};
use crate::patch::{Diff, Edit, MapDiff, SeqDiff};
use crate::value::{ObjType, ScalarValue};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApplyError {
    #[error(transparent)]
    InvalidOp(#[from] InvalidOp),
    #[error("op {op} targets unknown object {obj}")]
    DanglingReference { op: OpId, obj: ObjId },
    #[error("link op {op} references unknown object {child}")]
    DanglingChild { op: OpId, child: OpId },
    #[error("op {op} references unknown element {elem} in {obj}")]
    MissingElement { op: OpId, elem: OpId, obj: ObjId },
    #[error("op {op} addresses object {obj} with the wrong key kind")]
    WrongKeyKind { op: OpId, obj: ObjId },
    #[error("insert op {op} targets non-sequence object {obj}")]
    NotASequence { op: OpId, obj: ObjId },
}

/// What one active op contributes: a primitive, or a child object.
#[derive(Clone, Debug, PartialEq)]
enum AssignValue {
    Scalar(ScalarValue),
    Object(ObjId),
}

#[derive(Clone, Debug, PartialEq)]
struct Assignment {
    value: AssignValue,
    /// Accumulated `inc` deltas; only meaningful on counter assignments.
    inc: i64,
}

impl Assignment {
    fn scalar(value: ScalarValue) -> Self {
        Assignment {
            value: AssignValue::Scalar(value),
            inc: 0,
        }
    }

    fn object(id: ObjId) -> Self {
        Assignment {
            value: AssignValue::Object(id),
            inc: 0,
        }
    }

    fn rendered_scalar(&self) -> Option<ScalarValue> {
        match &self.value {
            AssignValue::Scalar(ScalarValue::Counter(base)) => {
                Some(ScalarValue::Counter(base + self.inc))
            }
            AssignValue::Scalar(v) => Some(v.clone()),
            AssignValue::Object(_) => None,
        }
    }
}

type Assignments = BTreeMap<OpId, Assignment>;

#[derive(Clone, Debug)]
struct SeqElem {
    elem_id: OpId,
    active: Assignments,
}

impl SeqElem {
    fn visible(&self) -> bool {
        !self.active.is_empty()
    }
}

#[derive(Clone, Debug)]
struct ObjState {
    obj_type: ObjType,
    props: BTreeMap<String, Assignments>,
    elems: Vec<SeqElem>,
}

impl ObjState {
    fn new(obj_type: ObjType) -> Self {
        ObjState {
            obj_type,
            props: BTreeMap::new(),
            elems: Vec::new(),
        }
    }

    fn is_seq(&self) -> bool {
        self.obj_type.is_sequence()
    }

    fn find_elem(&self, elem_id: &OpId) -> Option<usize> {
        self.elems.iter().position(|e| &e.elem_id == elem_id)
    }

    /// Count of visible elements strictly before `pos`.
    fn visible_before(&self, pos: usize) -> usize {
        self.elems[..pos].iter().filter(|e| e.visible()).count()
    }
}

/// Edits recorded while a batch applies; indices are visible positions at
/// the moment of the op, which is exactly the post-edit replay order a
/// patch promises.
#[derive(Clone, Debug)]
enum RecEdit {
    Insert { index: usize, elem: OpId },
    Update { index: usize, elem: OpId },
    Remove { index: usize },
}

/// Accumulates observable effects over a batch of changes; consumed by
/// `OpSet::build_patch`.
#[derive(Clone, Debug, Default)]
pub(crate) struct PatchLog {
    dirty_keys: BTreeMap<ObjId, BTreeSet<String>>,
    edits: BTreeMap<ObjId, Vec<RecEdit>>,
}

impl PatchLog {
    fn dirty_objects(&self) -> Vec<ObjId> {
        let mut objs: BTreeSet<ObjId> = self.dirty_keys.keys().cloned().collect();
        objs.extend(self.edits.keys().cloned());
        objs.into_iter().collect()
    }

    fn remove(&mut self, obj: &ObjId) {
        self.dirty_keys.remove(obj);
        self.edits.remove(obj);
    }

    fn mark_key(&mut self, obj: &ObjId, key: &str) {
        self.dirty_keys
            .entry(obj.clone())
            .or_default()
            .insert(key.to_string());
    }

    fn push_edit(&mut self, obj: &ObjId, edit: RecEdit) {
        self.edits.entry(obj.clone()).or_default().push(edit);
    }
}

/// Resolved slot of a non-insert op: a map key or an existing element.
enum Slot {
    MapKey(String),
    Elem(usize),
}

#[derive(Clone, Debug)]
pub struct OpSet {
    objects: BTreeMap<ObjId, ObjState>,
    /// Child object -> (parent object, key within the parent). Updated on
    /// make and link; the tree is acyclic by construction.
    parents: BTreeMap<ObjId, (ObjId, Key)>,
    max_op: u64,
}

impl Default for OpSet {
    fn default() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(ObjId::Root, ObjState::new(ObjType::Map));
        OpSet {
            objects,
            parents: BTreeMap::new(),
            max_op: 0,
        }
    }
}

impl OpSet {
    pub fn new() -> Self {
        OpSet::default()
    }

    pub fn max_op(&self) -> u64 {
        self.max_op
    }

    pub fn contains_object(&self, obj: &ObjId) -> bool {
        self.objects.contains_key(obj)
    }

    pub fn object_type(&self, obj: &ObjId) -> Option<ObjType> {
        self.objects.get(obj).map(|s| s.obj_type)
    }

    /// Apply one change, recording observable effects into `log`. The
    /// history DAG guarantees each change arrives exactly once, deps first.
    pub(crate) fn apply_change(
        &mut self,
        change: &Change,
        log: &mut PatchLog,
    ) -> Result<(), ApplyError> {
        for op in &change.ops {
            op.validate()?;
        }
        for row in change.expanded_ops() {
            self.max_op = self.max_op.max(row.id.counter);
            let row_id = row.id.clone();
            let obj = row.obj.clone();
            if row.insert {
                self.apply_insert(&obj, &row.key, row_id, row.action, row.value, row.child, log)?;
            } else {
                self.apply_assign(
                    &obj, &row.key, row_id, row.action, row.value, row.child, row.pred, log,
                )?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_insert(
        &mut self,
        obj: &ObjId,
        key: &Key,
        id: OpId,
        action: OpType,
        value: Option<&ScalarValue>,
        child: Option<&OpId>,
        log: &mut PatchLog,
    ) -> Result<(), ApplyError> {
        let Key::Elem(after) = key else {
            return Err(ApplyError::WrongKeyKind {
                op: id,
                obj: obj.clone(),
            });
        };

        let pos = {
            let state = self
                .objects
                .get(obj)
                .ok_or_else(|| ApplyError::DanglingReference {
                    op: id.clone(),
                    obj: obj.clone(),
                })?;
            if !state.is_seq() {
                return Err(ApplyError::NotASequence {
                    op: id,
                    obj: obj.clone(),
                });
            }
            let mut pos = match after {
                ElemId::Head => 0,
                ElemId::Op(elem) => {
                    state
                        .find_elem(elem)
                        .ok_or_else(|| ApplyError::MissingElement {
                            op: id.clone(),
                            elem: elem.clone(),
                            obj: obj.clone(),
                        })?
                        + 1
                }
            };
            // RGA: concurrent siblings at the same spot order by OpId
            // descending; any descendant of a greater sibling is itself
            // greater, so one comparison per element suffices.
            while pos < state.elems.len() && state.elems[pos].elem_id > id {
                pos += 1;
            }
            pos
        };

        let parent_key = Key::elem(id.clone());
        let assignment = self.make_assignment(obj, parent_key, &id, action, value, child)?;

        let state = self.objects.get_mut(obj).expect("object checked above");
        let mut active = Assignments::new();
        active.insert(id.clone(), assignment);
        state.elems.insert(
            pos,
            SeqElem {
                elem_id: id.clone(),
                active,
            },
        );
        let index = state.visible_before(pos);
        log.push_edit(obj, RecEdit::Insert { index, elem: id });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_assign(
        &mut self,
        obj: &ObjId,
        key: &Key,
        id: OpId,
        action: OpType,
        value: Option<&ScalarValue>,
        child: Option<&OpId>,
        pred: &[OpId],
        log: &mut PatchLog,
    ) -> Result<(), ApplyError> {
        let slot = {
            let state = self
                .objects
                .get(obj)
                .ok_or_else(|| ApplyError::DanglingReference {
                    op: id.clone(),
                    obj: obj.clone(),
                })?;
            match key {
                Key::Map(s) if !state.is_seq() => Slot::MapKey(s.clone()),
                Key::Elem(ElemId::Op(elem)) if state.is_seq() => Slot::Elem(
                    state
                        .find_elem(elem)
                        .ok_or_else(|| ApplyError::MissingElement {
                            op: id.clone(),
                            elem: elem.clone(),
                            obj: obj.clone(),
                        })?,
                ),
                _ => {
                    return Err(ApplyError::WrongKeyKind {
                        op: id,
                        obj: obj.clone(),
                    })
                }
            }
        };

        if action == OpType::Inc {
            let delta = match value {
                Some(ScalarValue::Int(d)) => *d,
                _ => return Err(InvalidOp::NonIntegerIncrement.into()),
            };
            self.apply_inc(obj, slot, &id, delta, pred, log);
            return Ok(());
        }

        let assignment = match action {
            OpType::Del => None,
            _ => {
                let parent_key = match &slot {
                    Slot::MapKey(s) => Key::map(s.clone()),
                    Slot::Elem(idx) => {
                        let state = self.objects.get(obj).expect("object checked above");
                        Key::elem(state.elems[*idx].elem_id.clone())
                    }
                };
                Some(self.make_assignment(obj, parent_key, &id, action, value, child)?)
            }
        };

        let state = self.objects.get_mut(obj).expect("object checked above");
        match slot {
            Slot::MapKey(s) => {
                let set = state.props.entry(s.clone()).or_default();
                remove_preds(set, pred, &id);
                if let Some(assignment) = assignment {
                    set.insert(id, assignment);
                }
                log.mark_key(obj, &s);
            }
            Slot::Elem(idx) => {
                let was_visible = state.elems[idx].visible();
                {
                    let set = &mut state.elems[idx].active;
                    remove_preds(set, pred, &id);
                    if let Some(assignment) = assignment {
                        set.insert(id, assignment);
                    }
                }
                let now_visible = state.elems[idx].visible();
                let index = state.visible_before(idx);
                let elem = state.elems[idx].elem_id.clone();
                match (was_visible, now_visible) {
                    (true, false) => log.push_edit(obj, RecEdit::Remove { index }),
                    (true, true) => log.push_edit(obj, RecEdit::Update { index, elem }),
                    // Resurrection: a concurrent set on a tombstoned
                    // element makes it visible again.
                    (false, true) => log.push_edit(obj, RecEdit::Insert { index, elem }),
                    (false, false) => {}
                }
            }
        }
        Ok(())
    }

    fn apply_inc(
        &mut self,
        obj: &ObjId,
        slot: Slot,
        id: &OpId,
        delta: i64,
        pred: &[OpId],
        log: &mut PatchLog,
    ) {
        let state = self.objects.get_mut(obj).expect("object checked by caller");
        match slot {
            Slot::MapKey(s) => {
                if let Some(set) = state.props.get_mut(&s) {
                    attach_incs(set, pred, delta, id);
                }
                log.mark_key(obj, &s);
            }
            Slot::Elem(idx) => {
                attach_incs(&mut state.elems[idx].active, pred, delta, id);
                if state.elems[idx].visible() {
                    let index = state.visible_before(idx);
                    let elem = state.elems[idx].elem_id.clone();
                    log.push_edit(obj, RecEdit::Update { index, elem });
                }
            }
        }
    }

    fn make_assignment(
        &mut self,
        obj: &ObjId,
        parent_key: Key,
        id: &OpId,
        action: OpType,
        value: Option<&ScalarValue>,
        child: Option<&OpId>,
    ) -> Result<Assignment, ApplyError> {
        match action {
            OpType::Set => {
                let value = value.cloned().ok_or(InvalidOp::SetWithoutValue)?;
                Ok(Assignment::scalar(value))
            }
            OpType::Make(obj_type) => {
                let child_id = ObjId::Op(id.clone());
                self.objects.insert(child_id.clone(), ObjState::new(obj_type));
                self.parents
                    .insert(child_id.clone(), (obj.clone(), parent_key));
                Ok(Assignment::object(child_id))
            }
            OpType::Link => {
                let target = child.cloned().ok_or(InvalidOp::LinkWithoutChild)?;
                let child_id = ObjId::Op(target.clone());
                if !self.objects.contains_key(&child_id) {
                    return Err(ApplyError::DanglingChild {
                        op: id.clone(),
                        child: target,
                    });
                }
                self.parents
                    .insert(child_id.clone(), (obj.clone(), parent_key));
                Ok(Assignment::object(child_id))
            }
            OpType::Del | OpType::Inc => unreachable!("del/inc never produce assignments"),
        }
    }

    // ------------------------------------------------------------------
    // Patch construction
    // ------------------------------------------------------------------

    /// Build the batch's diff tree from the recorded log. Dirty objects
    /// reached through clean ancestors get pass-through entries carrying
    /// only the path; unreachable dirty objects are dropped (nothing
    /// observable changed).
    pub(crate) fn build_patch(&self, mut log: PatchLog) -> MapDiff {
        let mut nest: BTreeMap<ObjId, BTreeSet<ObjId>> = BTreeMap::new();
        for obj in log.dirty_objects() {
            if obj.is_root() {
                continue;
            }
            let mut steps = Vec::new();
            let mut cur = obj.clone();
            let reachable = loop {
                let Some((parent, key)) = self.parents.get(&cur) else {
                    break false;
                };
                if !self.link_active(parent, key, &cur) {
                    break false;
                }
                steps.push((parent.clone(), cur.clone()));
                if parent.is_root() {
                    break true;
                }
                cur = parent.clone();
            };
            if reachable {
                for (parent, child) in steps {
                    nest.entry(parent).or_default().insert(child);
                }
            } else {
                log.remove(&obj);
            }
        }
        match self.object_diff(&ObjId::Root, &mut log, &nest) {
            Diff::Map(diff) => diff,
            _ => unreachable!("root is a map"),
        }
    }

    /// Full render of the current document, as the diff from an empty one.
    pub(crate) fn full_diff(&self) -> MapDiff {
        let mut log = PatchLog::default();
        match self.render_object(&ObjId::Root, &mut log) {
            Diff::Map(diff) => diff,
            _ => unreachable!("root is a map"),
        }
    }

    /// Is `child` currently an active assignment of `parent` at `key`,
    /// through a visible element if the parent is a sequence?
    fn link_active(&self, parent: &ObjId, key: &Key, child: &ObjId) -> bool {
        let Some(state) = self.objects.get(parent) else {
            return false;
        };
        let set = match key {
            Key::Map(s) => state.props.get(s),
            Key::Elem(ElemId::Op(e)) => state.find_elem(e).map(|idx| &state.elems[idx].active),
            Key::Elem(ElemId::Head) => None,
        };
        set.is_some_and(|set| {
            set.values()
                .any(|a| a.value == AssignValue::Object(child.clone()))
        })
    }

    fn object_diff(&self, obj: &ObjId, log: &mut PatchLog, nest: &BTreeMap<ObjId, BTreeSet<ObjId>>) -> Diff {
        let state = &self.objects[obj];
        if state.is_seq() {
            Diff::Seq(self.seq_diff(obj, state, log, nest))
        } else {
            Diff::Map(self.map_diff(obj, state, log, nest))
        }
    }

    fn map_diff(
        &self,
        obj: &ObjId,
        state: &ObjState,
        log: &mut PatchLog,
        nest: &BTreeMap<ObjId, BTreeSet<ObjId>>,
    ) -> MapDiff {
        let children = nest.get(obj).cloned().unwrap_or_default();
        let mut keys = log.dirty_keys.remove(obj).unwrap_or_default();
        for child in &children {
            if let Some((_, Key::Map(s))) = self.parents.get(child) {
                keys.insert(s.clone());
            }
        }

        let mut diff = MapDiff::new(obj.clone(), state.obj_type);
        for key in keys {
            let mut entry = BTreeMap::new();
            if let Some(set) = state.props.get(&key) {
                for (op_id, assignment) in set {
                    entry.insert(
                        op_id.clone(),
                        self.assignment_diff(assignment, log, nest, &children),
                    );
                }
            }
            diff.props.insert(key, entry);
        }
        diff
    }

    fn seq_diff(
        &self,
        obj: &ObjId,
        state: &ObjState,
        log: &mut PatchLog,
        nest: &BTreeMap<ObjId, BTreeSet<ObjId>>,
    ) -> SeqDiff {
        let children = nest.get(obj).cloned().unwrap_or_default();
        let recorded = log.edits.remove(obj).unwrap_or_default();
        let mut nested_here: BTreeSet<ObjId> = BTreeSet::new();

        let mut edits: Vec<Edit> = Vec::with_capacity(recorded.len());
        for rec in recorded {
            match rec {
                RecEdit::Insert { index, elem } => {
                    let values = self.elem_values(state, &elem, log, nest, &children, &mut nested_here);
                    edits.push(Edit::Insert {
                        index,
                        elem_id: elem,
                        values,
                    });
                }
                RecEdit::Update { index, elem } => {
                    let values = self.elem_values(state, &elem, log, nest, &children, &mut nested_here);
                    edits.push(Edit::Update { index, values });
                }
                RecEdit::Remove { index } => match edits.last_mut() {
                    Some(Edit::Remove {
                        index: prev,
                        count,
                    }) if *prev == index => *count += 1,
                    _ => edits.push(Edit::Remove { index, count: 1 }),
                },
            }
        }

        // Dirty children reached through this sequence without a recorded
        // edit of their own element.
        for child in &children {
            if nested_here.contains(child) {
                continue;
            }
            let Some((_, Key::Elem(ElemId::Op(elem)))) = self.parents.get(child) else {
                continue;
            };
            let Some(idx) = state.find_elem(elem) else {
                continue;
            };
            if !state.elems[idx].visible() {
                continue;
            }
            let index = state.visible_before(idx);
            let elem = elem.clone();
            let values = self.elem_values(state, &elem, log, nest, &children, &mut nested_here);
            edits.push(Edit::Update { index, values });
        }

        let mut diff = SeqDiff::new(obj.clone(), state.obj_type);
        diff.edits = coalesce_inserts(edits);
        diff
    }

    #[allow(clippy::too_many_arguments)]
    fn elem_values(
        &self,
        state: &ObjState,
        elem: &OpId,
        log: &mut PatchLog,
        nest: &BTreeMap<ObjId, BTreeSet<ObjId>>,
        children: &BTreeSet<ObjId>,
        nested_here: &mut BTreeSet<ObjId>,
    ) -> BTreeMap<OpId, Diff> {
        let mut values = BTreeMap::new();
        if let Some(idx) = state.find_elem(elem) {
            for (op_id, assignment) in &state.elems[idx].active {
                if let AssignValue::Object(child) = &assignment.value {
                    if children.contains(child) {
                        nested_here.insert(child.clone());
                    }
                }
                values.insert(
                    op_id.clone(),
                    self.assignment_diff(assignment, log, nest, children),
                );
            }
        }
        values
    }

    fn assignment_diff(
        &self,
        assignment: &Assignment,
        log: &mut PatchLog,
        nest: &BTreeMap<ObjId, BTreeSet<ObjId>>,
        children: &BTreeSet<ObjId>,
    ) -> Diff {
        match &assignment.value {
            AssignValue::Scalar(_) => Diff::value(
                assignment
                    .rendered_scalar()
                    .expect("scalar assignment renders"),
            ),
            AssignValue::Object(child) => {
                if children.contains(child) {
                    self.object_diff(child, log, nest)
                } else {
                    self.render_object(child, log)
                }
            }
        }
    }

    /// Render an object's entire current subtree, consuming any records
    /// for it (a full render supersedes incremental edits).
    fn render_object(&self, obj: &ObjId, log: &mut PatchLog) -> Diff {
        log.remove(obj);
        let state = &self.objects[obj];
        if state.is_seq() {
            let mut edits = Vec::new();
            let mut index = 0usize;
            for elem in state.elems.iter().filter(|e| e.visible()) {
                let mut values = BTreeMap::new();
                for (op_id, assignment) in &elem.active {
                    values.insert(op_id.clone(), self.rendered_assignment(assignment, log));
                }
                edits.push(Edit::Insert {
                    index,
                    elem_id: elem.elem_id.clone(),
                    values,
                });
                index += 1;
            }
            let mut diff = SeqDiff::new(obj.clone(), state.obj_type);
            diff.edits = coalesce_inserts(edits);
            Diff::Seq(diff)
        } else {
            let mut diff = MapDiff::new(obj.clone(), state.obj_type);
            for (key, set) in &state.props {
                if set.is_empty() {
                    continue;
                }
                let mut entry = BTreeMap::new();
                for (op_id, assignment) in set {
                    entry.insert(op_id.clone(), self.rendered_assignment(assignment, log));
                }
                diff.props.insert(key.clone(), entry);
            }
            Diff::Map(diff)
        }
    }

    fn rendered_assignment(&self, assignment: &Assignment, log: &mut PatchLog) -> Diff {
        match &assignment.value {
            AssignValue::Scalar(_) => Diff::value(
                assignment
                    .rendered_scalar()
                    .expect("scalar assignment renders"),
            ),
            AssignValue::Object(child) => self.render_object(child, log),
        }
    }
}

fn remove_preds(set: &mut Assignments, pred: &[OpId], op: &OpId) {
    for p in pred {
        if set.remove(p).is_none() {
            // Predecessor already overridden by a concurrent op; benign.
            warn!(op = %op, pred = %p, "pred not active at apply time");
        }
    }
}

fn attach_incs(set: &mut Assignments, pred: &[OpId], delta: i64, op: &OpId) {
    for p in pred {
        match set.get_mut(p) {
            Some(a) if matches!(a.value, AssignValue::Scalar(ScalarValue::Counter(_))) => {
                a.inc += delta;
            }
            _ => warn!(op = %op, pred = %p, "inc target is not an active counter"),
        }
    }
}

/// Merge runs of adjacent single-value primitive inserts by one actor into
/// multi-inserts.
fn coalesce_inserts(edits: Vec<Edit>) -> Vec<Edit> {
    let mut out: Vec<Edit> = Vec::with_capacity(edits.len());
    for edit in edits {
        let run_value = match &edit {
            Edit::Insert {
                index,
                elem_id,
                values,
            } if values.len() == 1 => match values.get(elem_id) {
                Some(Diff::Value { value }) => Some((*index, elem_id.clone(), value.clone())),
                _ => None,
            },
            _ => None,
        };
        let Some((index, elem_id, value)) = run_value else {
            out.push(edit);
            continue;
        };

        match out.last_mut() {
            Some(Edit::MultiInsert {
                index: start,
                elem_id: base,
                values,
            }) if index == *start + values.len()
                && elem_id.actor == base.actor
                && elem_id.counter == base.counter + values.len() as u64 =>
            {
                values.push(value);
            }
            Some(Edit::Insert {
                index: prev_index,
                elem_id: prev_elem,
                values: prev_values,
            }) if index == *prev_index + 1
                && elem_id.actor == prev_elem.actor
                && elem_id.counter == prev_elem.counter + 1
                && prev_values.len() == 1
                && matches!(prev_values.get(prev_elem), Some(Diff::Value { .. })) =>
            {
                let Some(Diff::Value { value: prev_value }) = prev_values.get(prev_elem).cloned()
                else {
                    unreachable!("matched above");
                };
                let merged = Edit::MultiInsert {
                    index: *prev_index,
                    elem_id: prev_elem.clone(),
                    values: vec![prev_value, value],
                };
                *out.last_mut().expect("just matched") = merged;
            }
            _ => out.push(edit),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ActorId;
    use crate::op::Op;

    fn actor(byte: u8) -> ActorId {
        ActorId::from_bytes(vec![byte]).unwrap()
    }

    fn opid(counter: u64, actor_byte: u8) -> OpId {
        OpId::new(counter, actor(actor_byte))
    }

    fn change_of(actor_byte: u8, seq: u64, start_op: u64, ops: Vec<Op>) -> Change {
        Change::new(actor(actor_byte), seq, start_op, 0, None, vec![], ops)
    }

    fn apply(opset: &mut OpSet, change: &Change) -> PatchLog {
        let mut log = PatchLog::default();
        opset.apply_change(change, &mut log).unwrap();
        log
    }

    #[test]
    fn set_overrides_its_preds() {
        let mut opset = OpSet::new();
        let first = change_of(
            1,
            1,
            1,
            vec![Op::set(ObjId::Root, Key::map("k"), 1i64.into(), vec![])],
        );
        apply(&mut opset, &first);
        let second = change_of(
            1,
            2,
            2,
            vec![Op::set(
                ObjId::Root,
                Key::map("k"),
                2i64.into(),
                vec![opid(1, 1)],
            )],
        );
        let log = apply(&mut opset, &second);

        let diff = opset.build_patch(log);
        let entry = &diff.props["k"];
        assert_eq!(entry.len(), 1);
        assert_eq!(
            entry[&opid(2, 1)],
            Diff::value(ScalarValue::Int(2))
        );
    }

    #[test]
    fn concurrent_sets_without_mutual_preds_both_stay_active() {
        let mut opset = OpSet::new();
        apply(
            &mut opset,
            &change_of(1, 1, 1, vec![Op::set(ObjId::Root, Key::map("k"), 1i64.into(), vec![])]),
        );
        let log = apply(
            &mut opset,
            &change_of(2, 1, 1, vec![Op::set(ObjId::Root, Key::map("k"), 2i64.into(), vec![])]),
        );

        let diff = opset.build_patch(log);
        assert_eq!(diff.props["k"].len(), 2);
    }

    #[test]
    fn delete_emits_the_empty_entry() {
        let mut opset = OpSet::new();
        apply(
            &mut opset,
            &change_of(1, 1, 1, vec![Op::set(ObjId::Root, Key::map("k"), 1i64.into(), vec![])]),
        );
        let log = apply(
            &mut opset,
            &change_of(1, 2, 2, vec![Op::del(ObjId::Root, Key::map("k"), vec![opid(1, 1)])]),
        );

        let diff = opset.build_patch(log);
        assert_eq!(diff.props["k"], std::collections::BTreeMap::new());
    }

    #[test]
    fn missing_pred_is_benign() {
        let mut opset = OpSet::new();
        apply(
            &mut opset,
            &change_of(1, 1, 1, vec![Op::set(ObjId::Root, Key::map("k"), 1i64.into(), vec![])]),
        );
        // Pred references an op that never assigned here.
        let log = apply(
            &mut opset,
            &change_of(
                2,
                1,
                5,
                vec![Op::set(
                    ObjId::Root,
                    Key::map("k"),
                    2i64.into(),
                    vec![opid(4, 9)],
                )],
            ),
        );
        let diff = opset.build_patch(log);
        // Both the old and the new assignment stay active.
        assert_eq!(diff.props["k"].len(), 2);
    }

    #[test]
    fn dangling_object_reference_fails() {
        let mut opset = OpSet::new();
        let change = change_of(
            1,
            1,
            1,
            vec![Op::set(
                ObjId::Op(opid(9, 9)),
                Key::map("k"),
                1i64.into(),
                vec![],
            )],
        );
        let mut log = PatchLog::default();
        let err = opset.apply_change(&change, &mut log).unwrap_err();
        assert!(matches!(err, ApplyError::DanglingReference { .. }));
    }

    #[test]
    fn rga_orders_concurrent_head_inserts_descending() {
        let mut opset = OpSet::new();
        apply(
            &mut opset,
            &change_of(
                1,
                1,
                1,
                vec![Op::make(ObjId::Root, Key::map("list"), ObjType::List, false, vec![])],
            ),
        );
        let list = ObjId::Op(opid(1, 1));
        // Two concurrent head inserts by different actors.
        apply(
            &mut opset,
            &change_of(2, 1, 2, vec![Op::insert(list.clone(), ElemId::Head, "low".into())]),
        );
        apply(
            &mut opset,
            &change_of(3, 1, 2, vec![Op::insert(list.clone(), ElemId::Head, "high".into())]),
        );

        let diff = opset.full_diff();
        let Diff::Seq(seq) = &diff.props["list"][&opid(1, 1)] else {
            panic!("expected list diff");
        };
        let texts: Vec<_> = seq
            .edits
            .iter()
            .map(|edit| match edit {
                Edit::Insert { values, .. } => values.values().next().cloned().unwrap(),
                other => panic!("unexpected edit {other:?}"),
            })
            .collect();
        assert_eq!(
            texts,
            vec![
                Diff::value(ScalarValue::Str("high".into())),
                Diff::value(ScalarValue::Str("low".into())),
            ]
        );
    }

    #[test]
    fn tombstoned_elements_keep_their_position_for_inserts() {
        let mut opset = OpSet::new();
        apply(
            &mut opset,
            &change_of(
                1,
                1,
                1,
                vec![
                    Op::make(ObjId::Root, Key::map("list"), ObjType::List, false, vec![]),
                    Op::insert(ObjId::Op(opid(1, 1)), ElemId::Head, "a".into()),
                    Op::insert(ObjId::Op(opid(1, 1)), ElemId::Op(opid(2, 1)), "b".into()),
                ],
            ),
        );
        let list = ObjId::Op(opid(1, 1));
        // Delete "a", then insert after its (tombstoned) elemId.
        apply(
            &mut opset,
            &change_of(
                1,
                2,
                4,
                vec![Op::del(list.clone(), Key::elem(opid(2, 1)), vec![opid(2, 1)])],
            ),
        );
        apply(
            &mut opset,
            &change_of(
                1,
                3,
                5,
                vec![Op::insert(list.clone(), ElemId::Op(opid(2, 1)), "c".into())],
            ),
        );

        let diff = opset.full_diff();
        let Diff::Seq(seq) = &diff.props["list"][&opid(1, 1)] else {
            panic!("expected list diff");
        };
        // Visible order: c (inserted after the tombstone of a), then b.
        let Edit::Insert { index: 0, values, .. } = &seq.edits[0] else {
            panic!("unexpected edits {:?}", seq.edits);
        };
        assert_eq!(
            values.values().next(),
            Some(&Diff::value(ScalarValue::Str("c".into())))
        );
    }

    #[test]
    fn counter_renders_base_plus_increments() {
        let mut opset = OpSet::new();
        apply(
            &mut opset,
            &change_of(
                1,
                1,
                1,
                vec![Op::set(ObjId::Root, Key::map("n"), ScalarValue::Counter(10), vec![])],
            ),
        );
        let log = apply(
            &mut opset,
            &change_of(
                1,
                2,
                2,
                vec![Op::inc(ObjId::Root, Key::map("n"), -3, vec![opid(1, 1)])],
            ),
        );

        let diff = opset.build_patch(log);
        assert_eq!(
            diff.props["n"][&opid(1, 1)],
            Diff::value(ScalarValue::Counter(7))
        );
    }

    #[test]
    fn nested_object_changes_pass_through_clean_ancestors() {
        let mut opset = OpSet::new();
        apply(
            &mut opset,
            &change_of(
                1,
                1,
                1,
                vec![Op::make(ObjId::Root, Key::map("nest"), ObjType::Map, false, vec![])],
            ),
        );
        // Only the nested map changes; the root entry is a pass-through.
        let log = apply(
            &mut opset,
            &change_of(
                1,
                2,
                2,
                vec![Op::set(
                    ObjId::Op(opid(1, 1)),
                    Key::map("eggs"),
                    3i64.into(),
                    vec![],
                )],
            ),
        );

        let diff = opset.build_patch(log);
        let Diff::Map(nested) = &diff.props["nest"][&opid(1, 1)] else {
            panic!("expected nested map diff");
        };
        assert_eq!(
            nested.props["eggs"][&opid(2, 1)],
            Diff::value(ScalarValue::Int(3))
        );
    }
}
