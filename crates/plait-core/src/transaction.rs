//! Recording user mutations as an op stream.
//!
//! A `Transaction` runs against an overlay of the snapshot so that ops can
//! reference objects and elements created earlier in the same change; the
//! overlay is discarded once the ops are committed, and the snapshot
//! catches up through the engine's patch.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::change::Change;
use crate::doc::{Doc, DocObject, Slot};
use crate::identity::{ActorId, ElemId, Key, ObjId, OpId};
use crate::op::Op;
use crate::value::{ObjType, ScalarValue};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransactionError {
    #[error("unknown object {obj}")]
    UnknownObject { obj: ObjId },
    #[error("{obj} is not a map or table")]
    NotAMap { obj: ObjId },
    #[error("{obj} is not a list or text")]
    NotASequence { obj: ObjId },
    #[error("{obj} is not a text object")]
    NotText { obj: ObjId },
    #[error("index {index} out of bounds for {obj} (len {len})")]
    IndexOutOfBounds {
        obj: ObjId,
        index: usize,
        len: usize,
    },
    #[error("key `{key}` not present in {obj}")]
    KeyMissing { obj: ObjId, key: String },
    #[error("no counter at `{key}` in {obj}")]
    NotACounter { obj: ObjId, key: String },
}

/// Records ops for one change.
pub struct Transaction {
    overlay: BTreeMap<ObjId, DocObject>,
    ops: Vec<Op>,
    next_counter: u64,
    actor: ActorId,
}

impl Transaction {
    fn new(doc: &Doc) -> Self {
        Transaction {
            overlay: doc.clone_objects(),
            ops: Vec::new(),
            next_counter: doc.max_op() + 1,
            actor: doc.actor_id().clone(),
        }
    }

    fn next_id(&mut self, width: u64) -> OpId {
        let id = OpId::new(self.next_counter, self.actor.clone());
        self.next_counter += width;
        id
    }

    fn object(&self, obj: &ObjId) -> Result<&DocObject, TransactionError> {
        self.overlay
            .get(obj)
            .ok_or_else(|| TransactionError::UnknownObject { obj: obj.clone() })
    }

    fn map_object(&self, obj: &ObjId) -> Result<&DocObject, TransactionError> {
        let object = self.object(obj)?;
        if object.obj_type.is_sequence() {
            return Err(TransactionError::NotAMap { obj: obj.clone() });
        }
        Ok(object)
    }

    fn seq_object(&self, obj: &ObjId) -> Result<&DocObject, TransactionError> {
        let object = self.object(obj)?;
        if !object.obj_type.is_sequence() {
            return Err(TransactionError::NotASequence { obj: obj.clone() });
        }
        Ok(object)
    }

    fn pred_at(&self, obj: &ObjId, key: &str) -> Vec<OpId> {
        self.overlay
            .get(obj)
            .and_then(|o| o.props.get(key))
            .map(|conflicts| conflicts.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Assign a primitive at a map key.
    pub fn set(
        &mut self,
        obj: &ObjId,
        key: &str,
        value: impl Into<ScalarValue>,
    ) -> Result<(), TransactionError> {
        self.map_object(obj)?;
        let value = value.into();
        let pred = self.pred_at(obj, key);
        let id = self.next_id(1);
        self.ops
            .push(Op::set(obj.clone(), Key::map(key), value.clone(), pred));
        let object = self.overlay.get_mut(obj).expect("checked above");
        object
            .props
            .insert(key.to_string(), BTreeMap::from([(id, Slot::Scalar(value))]));
        Ok(())
    }

    /// Create a composite object at a map key; returns the new object id.
    pub fn set_object(
        &mut self,
        obj: &ObjId,
        key: &str,
        obj_type: ObjType,
    ) -> Result<ObjId, TransactionError> {
        self.map_object(obj)?;
        let pred = self.pred_at(obj, key);
        let id = self.next_id(1);
        let child = ObjId::Op(id.clone());
        self.ops
            .push(Op::make(obj.clone(), Key::map(key), obj_type, false, pred));
        self.overlay.insert(child.clone(), DocObject::new(obj_type));
        let object = self.overlay.get_mut(obj).expect("checked above");
        object.props.insert(
            key.to_string(),
            BTreeMap::from([(id, Slot::Object(child.clone()))]),
        );
        Ok(child)
    }

    /// Delete a map key.
    pub fn delete(&mut self, obj: &ObjId, key: &str) -> Result<(), TransactionError> {
        self.map_object(obj)?;
        let pred = self.pred_at(obj, key);
        if pred.is_empty() {
            return Err(TransactionError::KeyMissing {
                obj: obj.clone(),
                key: key.to_string(),
            });
        }
        self.next_id(1);
        self.ops.push(Op::del(obj.clone(), Key::map(key), pred));
        let object = self.overlay.get_mut(obj).expect("checked above");
        object.props.remove(key);
        Ok(())
    }

    /// Add to the counter at a map key.
    pub fn increment(&mut self, obj: &ObjId, key: &str, by: i64) -> Result<(), TransactionError> {
        self.map_object(obj)?;
        let object = self.object(obj)?;
        let pred: Vec<OpId> = object
            .props
            .get(key)
            .map(|conflicts| {
                conflicts
                    .iter()
                    .filter(|(_, slot)| matches!(slot, Slot::Scalar(ScalarValue::Counter(_))))
                    .map(|(op_id, _)| op_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        if pred.is_empty() {
            return Err(TransactionError::NotACounter {
                obj: obj.clone(),
                key: key.to_string(),
            });
        }
        self.next_id(1);
        self.ops.push(Op::inc(obj.clone(), Key::map(key), by, pred));
        let object = self.overlay.get_mut(obj).expect("checked above");
        if let Some(conflicts) = object.props.get_mut(key) {
            for slot in conflicts.values_mut() {
                if let Slot::Scalar(ScalarValue::Counter(n)) = slot {
                    *n += by;
                }
            }
        }
        Ok(())
    }

    fn insert_ref(&self, obj: &ObjId, index: usize) -> Result<ElemId, TransactionError> {
        let object = self.seq_object(obj)?;
        if index > object.elems.len() {
            return Err(TransactionError::IndexOutOfBounds {
                obj: obj.clone(),
                index,
                len: object.elems.len(),
            });
        }
        Ok(if index == 0 {
            ElemId::Head
        } else {
            ElemId::Op(object.elems[index - 1].0.clone())
        })
    }

    /// Insert a primitive at a list index.
    pub fn insert(
        &mut self,
        obj: &ObjId,
        index: usize,
        value: impl Into<ScalarValue>,
    ) -> Result<(), TransactionError> {
        let after = self.insert_ref(obj, index)?;
        let value = value.into();
        let id = self.next_id(1);
        self.ops.push(Op::insert(obj.clone(), after, value.clone()));
        let object = self.overlay.get_mut(obj).expect("checked above");
        object
            .elems
            .insert(index, (id.clone(), BTreeMap::from([(id, Slot::Scalar(value))])));
        Ok(())
    }

    /// Insert a run of primitives at a list index; encoded as one
    /// multi-value op when longer than one element.
    pub fn splice(
        &mut self,
        obj: &ObjId,
        index: usize,
        values: Vec<ScalarValue>,
    ) -> Result<(), TransactionError> {
        match values.len() {
            0 => Ok(()),
            1 => self.insert(obj, index, values.into_iter().next().expect("len 1")),
            n => {
                let after = self.insert_ref(obj, index)?;
                let id = self.next_id(n as u64);
                self.ops
                    .push(Op::insert_many(obj.clone(), after, values.clone()));
                let object = self.overlay.get_mut(obj).expect("checked above");
                for (offset, value) in values.into_iter().enumerate() {
                    let elem = OpId::new(id.counter + offset as u64, id.actor.clone());
                    object.elems.insert(
                        index + offset,
                        (elem.clone(), BTreeMap::from([(elem, Slot::Scalar(value))])),
                    );
                }
                Ok(())
            }
        }
    }

    /// Create a composite object as a new list element.
    pub fn insert_object(
        &mut self,
        obj: &ObjId,
        index: usize,
        obj_type: ObjType,
    ) -> Result<ObjId, TransactionError> {
        let after = self.insert_ref(obj, index)?;
        let id = self.next_id(1);
        let child = ObjId::Op(id.clone());
        self.ops.push(Op::make(
            obj.clone(),
            Key::Elem(after),
            obj_type,
            true,
            Vec::new(),
        ));
        self.overlay.insert(child.clone(), DocObject::new(obj_type));
        let object = self.overlay.get_mut(obj).expect("checked above");
        object.elems.insert(
            index,
            (id.clone(), BTreeMap::from([(id, Slot::Object(child.clone()))])),
        );
        Ok(child)
    }

    /// Overwrite the element at a list index.
    pub fn set_index(
        &mut self,
        obj: &ObjId,
        index: usize,
        value: impl Into<ScalarValue>,
    ) -> Result<(), TransactionError> {
        let object = self.seq_object(obj)?;
        let (elem_id, conflicts) = object.elems.get(index).ok_or_else(|| {
            TransactionError::IndexOutOfBounds {
                obj: obj.clone(),
                index,
                len: object.elems.len(),
            }
        })?;
        let elem_id = elem_id.clone();
        let pred: Vec<OpId> = conflicts.keys().cloned().collect();
        let value = value.into();
        let id = self.next_id(1);
        self.ops.push(Op::set(
            obj.clone(),
            Key::elem(elem_id.clone()),
            value.clone(),
            pred,
        ));
        let object = self.overlay.get_mut(obj).expect("checked above");
        object.elems[index] = (elem_id, BTreeMap::from([(id, Slot::Scalar(value))]));
        Ok(())
    }

    /// Delete the element at a list index.
    pub fn delete_index(&mut self, obj: &ObjId, index: usize) -> Result<(), TransactionError> {
        let object = self.seq_object(obj)?;
        let (elem_id, conflicts) = object.elems.get(index).ok_or_else(|| {
            TransactionError::IndexOutOfBounds {
                obj: obj.clone(),
                index,
                len: object.elems.len(),
            }
        })?;
        let elem_id = elem_id.clone();
        let pred: Vec<OpId> = conflicts.keys().cloned().collect();
        self.next_id(1);
        self.ops
            .push(Op::del(obj.clone(), Key::elem(elem_id), pred));
        let object = self.overlay.get_mut(obj).expect("checked above");
        object.elems.remove(index);
        Ok(())
    }

    /// Replace `delete` characters at `index` with `text`, one element per
    /// character.
    pub fn splice_text(
        &mut self,
        obj: &ObjId,
        index: usize,
        delete: usize,
        text: &str,
    ) -> Result<(), TransactionError> {
        {
            let object = self.seq_object(obj)?;
            if object.obj_type != ObjType::Text {
                return Err(TransactionError::NotText { obj: obj.clone() });
            }
        }
        for _ in 0..delete {
            self.delete_index(obj, index)?;
        }
        let values: Vec<ScalarValue> = text.chars().map(ScalarValue::from).collect();
        self.splice(obj, index, values)
    }

    fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Doc {
    /// Run a mutator and produce one change carrying its ops, with deps =
    /// current heads. Returns `None` when the mutator recorded nothing.
    ///
    /// The snapshot does not show the edit until the engine's patch for
    /// this change is applied back.
    pub fn change<F>(
        &mut self,
        message: Option<String>,
        mutator: F,
    ) -> Result<Option<Change>, TransactionError>
    where
        F: FnOnce(&mut Transaction) -> Result<(), TransactionError>,
    {
        let mut txn = Transaction::new(self);
        mutator(&mut txn)?;
        let ops = txn.into_ops();
        if ops.is_empty() {
            return Ok(None);
        }
        let seq = self.seq() + 1;
        let change = Change::new(
            self.actor_id().clone(),
            seq,
            self.max_op() + 1,
            wall_clock_ms(),
            message,
            self.heads().to_vec(),
            ops,
        );
        self.note_local_change(seq, change.num_ops());
        Ok(Some(change))
    }
}
