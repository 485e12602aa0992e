//! Multiplexing sync for many documents over one message channel.
//!
//! A connection owns one `SyncState` per docId and a synchronous send
//! callback; the `DocSet` is borrowed per call. Wire messages are a CBOR
//! envelope `[docId, payload]` around the §6 sync message bytes.

use std::collections::BTreeMap;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;
use tracing::{debug, trace};

use crate::docset::{DocId, DocSet, InvalidDocId};
use crate::message::SyncMessage;
use crate::state::{generate_sync_message, receive_sync_message, SyncError, SyncState};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("envelope: {0}")]
    Envelope(String),
    #[error(transparent)]
    DocId(#[from] InvalidDocId),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<minicbor::decode::Error> for ConnectionError {
    fn from(err: minicbor::decode::Error) -> Self {
        ConnectionError::Envelope(err.to_string())
    }
}

pub(crate) fn encode_envelope(id: &DocId, payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(id.as_str().len() + payload.len() + 8);
    let mut enc = Encoder::new(&mut buf);
    enc.array(2)
        .and_then(|enc| enc.str(id.as_str()))
        .and_then(|enc| enc.bytes(payload))
        .expect("encoding into a Vec cannot fail");
    Bytes::from(buf)
}

pub(crate) fn decode_envelope(bytes: &[u8]) -> Result<(DocId, Vec<u8>), ConnectionError> {
    let mut dec = Decoder::new(bytes);
    match dec.array()? {
        Some(2) => {}
        other => {
            return Err(ConnectionError::Envelope(format!(
                "expected 2-element array, got {other:?}"
            )))
        }
    }
    if dec.datatype()? != Type::String {
        return Err(ConnectionError::Envelope("docId must be a string".into()));
    }
    let id = DocId::new(dec.str()?)?;
    let payload = dec.bytes()?.to_vec();
    Ok((id, payload))
}

/// One end of a message channel carrying sync for many documents.
pub struct Connection {
    states: BTreeMap<DocId, SyncState>,
    send: Box<dyn FnMut(Bytes)>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(send: impl FnMut(Bytes) + 'static) -> Self {
        Connection {
            states: BTreeMap::new(),
            send: Box::new(send),
        }
    }

    /// Announce every document we hold: first sync message per docId.
    pub fn open(&mut self, docs: &DocSet) {
        let ids: Vec<DocId> = docs.doc_ids().cloned().collect();
        for id in ids {
            self.generate_and_send(docs, &id);
        }
    }

    /// Ask the peer for a document we do not hold: an empty message for
    /// its docId.
    pub fn request(&mut self, id: &DocId) {
        let msg = SyncMessage {
            heads: vec![],
            need: vec![],
            have: vec![],
            changes: vec![],
        };
        self.send_message(id, &msg);
        self.states.entry(id.clone()).or_default();
    }

    /// Notify the connection that a document in the set changed locally.
    pub fn doc_changed(&mut self, docs: &DocSet, id: &DocId) {
        self.generate_and_send(docs, id);
    }

    /// Route one inbound envelope: apply to the right document, then send
    /// whatever the exchange calls for next.
    pub fn receive(&mut self, docs: &mut DocSet, bytes: &[u8]) -> Result<(), ConnectionError> {
        let (id, payload) = decode_envelope(bytes)?;
        let message = SyncMessage::decode(&payload).map_err(SyncError::from)?;

        let Some(doc) = docs.get_doc_mut(&id) else {
            // Advertisement (or sync noise) for a document we do not hold.
            trace!(%id, "ignoring message for unknown document");
            return Ok(());
        };

        let reply = {
            let state = self.states.entry(id.clone()).or_default();
            receive_sync_message(doc, state, message)?;
            generate_sync_message(doc, state)
        };
        if let Some(reply) = reply {
            debug!(%id, changes = reply.changes.len(), "replying");
            self.send_message(&id, &reply);
        }
        Ok(())
    }

    fn generate_and_send(&mut self, docs: &DocSet, id: &DocId) {
        let Some(doc) = docs.get_doc(id) else {
            return;
        };
        let msg = {
            let state = self.states.entry(id.clone()).or_default();
            generate_sync_message(doc, state)
        };
        if let Some(msg) = msg {
            self.send_message(id, &msg);
        }
    }

    fn send_message(&mut self, id: &DocId, msg: &SyncMessage) {
        let envelope = encode_envelope(id, &msg.encode());
        (self.send)(envelope);
    }
}
