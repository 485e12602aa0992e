//! One-value-per-document facade: snapshot + engine kept in lockstep.

use bytes::Bytes;

use crate::backend::Backend;
use crate::change::{Change, ChangeHash};
use crate::doc::{Doc, Value};
use crate::error::BackendError;
use crate::identity::{ActorId, ObjId, OpId};
use crate::limits::Limits;
use crate::patch::Patch;
use crate::transaction::{Transaction, TransactionError};
use crate::value::ObjType;

/// A document handle owning both halves of the engine. Most callers want
/// this; the split `Doc`/`Backend` surface exists for hosts that run the
/// two on different sides of a boundary.
#[derive(Clone, Debug)]
pub struct Document {
    doc: Doc,
    backend: Backend,
    last_local_change: Option<Change>,
}

impl Document {
    pub fn new() -> Self {
        Document::with_actor(ActorId::random())
    }

    pub fn with_actor(actor: ActorId) -> Self {
        Document {
            doc: Doc::with_actor(actor),
            backend: Backend::new(),
            last_local_change: None,
        }
    }

    pub fn with_limits(actor: ActorId, limits: Limits) -> Self {
        Document {
            doc: Doc::with_actor(actor),
            backend: Backend::with_limits(limits),
            last_local_change: None,
        }
    }

    pub fn actor_id(&self) -> &ActorId {
        self.doc.actor_id()
    }

    pub fn set_actor_id(&mut self, actor: ActorId) -> Result<(), BackendError> {
        self.doc.set_actor_id(actor)
    }

    pub fn get_heads(&self) -> Vec<ChangeHash> {
        self.backend.get_heads()
    }

    pub fn last_local_change(&self) -> Option<&Change> {
        self.last_local_change.as_ref()
    }

    /// Run a mutator, commit the resulting change, and fold the patch back
    /// into the snapshot. Returns the change's hash, or `None` for an
    /// empty mutation.
    pub fn change<F>(
        &mut self,
        message: impl Into<Option<String>>,
        mutator: F,
    ) -> Result<Option<ChangeHash>, BackendError>
    where
        F: FnOnce(&mut Transaction) -> Result<(), TransactionError>,
    {
        let Some(change) = self.doc.change(message.into(), mutator)? else {
            return Ok(None);
        };
        let hash = change.hash();
        let patch = self.backend.apply_local_change(change.clone())?;
        self.doc.apply_patch(&patch)?;
        self.last_local_change = Some(change);
        Ok(Some(hash))
    }

    /// Apply remote changes and fold the patch into the snapshot.
    pub fn apply_changes(&mut self, changes: Vec<Change>) -> Result<Patch, BackendError> {
        let patch = self.backend.apply_changes(changes)?;
        self.doc.apply_patch(&patch)?;
        Ok(patch)
    }

    pub fn apply_encoded_changes<B: AsRef<[u8]>>(
        &mut self,
        chunks: &[B],
    ) -> Result<Patch, BackendError> {
        let patch = self.backend.apply_encoded_changes(chunks)?;
        self.doc.apply_patch(&patch)?;
        Ok(patch)
    }

    /// Pull in every change the other document has that this one lacks.
    pub fn merge(&mut self, other: &Document) -> Result<Patch, BackendError> {
        if self.actor_id() == other.actor_id() {
            return Err(BackendError::ActorCollision {
                actor: self.actor_id().to_hex(),
            });
        }
        let missing: Vec<Change> = other
            .backend
            .get_all_changes()
            .into_iter()
            .filter(|stored| !self.backend.contains_change(&stored.hash))
            .map(|stored| stored.change.clone())
            .collect();
        self.apply_changes(missing)
    }

    pub fn save(&self) -> Vec<u8> {
        self.backend.save()
    }

    pub fn load(bytes: &[u8]) -> Result<Document, BackendError> {
        let backend = Backend::load(bytes)?;
        let mut doc = Doc::new();
        doc.apply_patch(&backend.get_patch())?;
        Ok(Document {
            doc,
            backend,
            last_local_change: None,
        })
    }

    // ------------------------------------------------------------------
    // Reads, delegated to the snapshot
    // ------------------------------------------------------------------

    pub fn get(&self, obj: &ObjId, key: &str) -> Option<Value> {
        self.doc.get(obj, key)
    }

    pub fn get_index(&self, obj: &ObjId, index: usize) -> Option<Value> {
        self.doc.get_index(obj, index)
    }

    pub fn get_conflicts(&self, obj: &ObjId, key: &str) -> std::collections::BTreeMap<OpId, Value> {
        self.doc.get_conflicts(obj, key)
    }

    pub fn get_object_id(&self, obj: &ObjId, key: &str) -> Option<ObjId> {
        self.doc.get_object_id(obj, key)
    }

    pub fn object_type(&self, obj: &ObjId) -> Option<ObjType> {
        self.doc.object_type(obj)
    }

    pub fn keys(&self, obj: &ObjId) -> Vec<String> {
        self.doc.keys(obj)
    }

    pub fn length(&self, obj: &ObjId) -> usize {
        self.doc.length(obj)
    }

    pub fn text(&self, obj: &ObjId) -> Option<String> {
        self.doc.text(obj)
    }

    // ------------------------------------------------------------------
    // Engine passthroughs for the sync layer
    // ------------------------------------------------------------------

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn get_missing_deps(&self, heads: &[ChangeHash]) -> Vec<ChangeHash> {
        self.backend.get_missing_deps(heads)
    }

    pub fn encoded_changes_since(
        &self,
        have_deps: &[ChangeHash],
    ) -> Result<Vec<Bytes>, BackendError> {
        self.backend.encoded_changes_since(have_deps)
    }

    pub fn contains_change(&self, hash: &ChangeHash) -> bool {
        self.backend.contains_change(hash)
    }
}

impl Default for Document {
    fn default() -> Self {
        Document::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarValue;

    fn actor(byte: u8) -> ActorId {
        ActorId::from_bytes(vec![byte]).unwrap()
    }

    #[test]
    fn local_edit_shows_in_the_snapshot() {
        let mut doc = Document::with_actor(actor(1));
        doc.change(None, |tx| tx.set(&ObjId::Root, "bird", "magpie"))
            .unwrap();
        assert_eq!(
            doc.get(&ObjId::Root, "bird"),
            Some(Value::Scalar(ScalarValue::Str("magpie".into())))
        );
        assert_eq!(doc.get_heads().len(), 1);
        assert!(doc.last_local_change().is_some());
    }

    #[test]
    fn empty_mutation_produces_no_change() {
        let mut doc = Document::with_actor(actor(1));
        let hash = doc.change(None, |_tx| Ok(())).unwrap();
        assert_eq!(hash, None);
        assert!(doc.get_heads().is_empty());
    }

    #[test]
    fn merge_rejects_equal_actors() {
        let mut a = Document::with_actor(actor(1));
        let b = Document::with_actor(actor(1));
        let err = a.merge(&b).unwrap_err();
        assert!(matches!(err, BackendError::ActorCollision { .. }));
    }

    #[test]
    fn merge_carries_changes_both_ways() {
        let mut a = Document::with_actor(actor(1));
        let mut b = Document::with_actor(actor(2));
        a.change(None, |tx| tx.set(&ObjId::Root, "wrens", 1i64)).unwrap();
        b.change(None, |tx| tx.set(&ObjId::Root, "robins", 1i64)).unwrap();

        a.merge(&b).unwrap();
        b.merge(&a).unwrap();

        for doc in [&a, &b] {
            assert_eq!(
                doc.get(&ObjId::Root, "wrens"),
                Some(Value::Scalar(ScalarValue::Int(1)))
            );
            assert_eq!(
                doc.get(&ObjId::Root, "robins"),
                Some(Value::Scalar(ScalarValue::Int(1)))
            );
        }
        assert_eq!(a.get_heads(), b.get_heads());
        assert_eq!(a.save(), b.save());
    }

    #[test]
    fn save_load_preserves_the_view() {
        let mut doc = Document::with_actor(actor(1));
        doc.change(None, |tx| {
            tx.set(&ObjId::Root, "bird", "magpie")?;
            let list = tx.set_object(&ObjId::Root, "list", ObjType::List)?;
            tx.insert(&list, 0, 1i64)?;
            tx.insert(&list, 1, 2i64)
        })
        .unwrap();

        let loaded = Document::load(&doc.save()).unwrap();
        assert_eq!(loaded.get(&ObjId::Root, "bird"), doc.get(&ObjId::Root, "bird"));
        let list = loaded.get_object_id(&ObjId::Root, "list").unwrap();
        assert_eq!(loaded.length(&list), 2);
        assert_eq!(loaded.save(), doc.save());
    }
}
