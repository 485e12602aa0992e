//! A table of documents addressed by docId.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use plait_core::Document;

/// Document identifier on the wire: a non-empty string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocId(String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("doc id `{raw}` is invalid: {reason}")]
pub struct InvalidDocId {
    pub raw: String,
    pub reason: String,
}

impl DocId {
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidDocId> {
        let s = s.into();
        if s.trim().is_empty() {
            return Err(InvalidDocId {
                raw: s,
                reason: "empty".into(),
            });
        }
        Ok(DocId(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({:?})", self.0)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocId {
    type Error = InvalidDocId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        DocId::new(s)
    }
}

impl From<DocId> for String {
    fn from(id: DocId) -> String {
        id.0
    }
}

/// The only shared mutable state across connections: docId → document.
/// Mutation is confined to `set_doc`/`get_doc_mut`; connections borrow the
/// set for the duration of each call.
#[derive(Debug, Default)]
pub struct DocSet {
    docs: BTreeMap<DocId, Document>,
}

impl DocSet {
    pub fn new() -> Self {
        DocSet::default()
    }

    pub fn set_doc(&mut self, id: DocId, doc: Document) {
        self.docs.insert(id, doc);
    }

    pub fn get_doc(&self, id: &DocId) -> Option<&Document> {
        self.docs.get(id)
    }

    pub fn get_doc_mut(&mut self, id: &DocId) -> Option<&mut Document> {
        self.docs.get_mut(id)
    }

    pub fn remove_doc(&mut self, id: &DocId) -> Option<Document> {
        self.docs.remove(id)
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = &DocId> {
        self.docs.keys()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}
