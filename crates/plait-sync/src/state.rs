//! Per-peer sync state and the generate/receive message cycle.

use std::collections::BTreeSet;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use plait_core::{BackendError, ChangeHash, Document, Patch};

use crate::bloom::BloomFilter;
use crate::message::{MessageDecodeError, SyncHave, SyncMessage};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error(transparent)]
    Message(#[from] MessageDecodeError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Everything we track about one peer for one document.
///
/// Nothing here is load-bearing for correctness: stale or lost state only
/// costs extra round-trips, never convergence.
#[derive(Clone, Debug, Default)]
pub struct SyncState {
    /// The deepest heads we believe the peer also has.
    pub shared_heads: Vec<ChangeHash>,
    /// Heads from their last message.
    pub their_heads: Option<Vec<ChangeHash>>,
    /// Hashes they explicitly asked for.
    pub their_need: Vec<ChangeHash>,
    /// Their last have entries (anchors + Bloom filters).
    pub their_have: Option<Vec<SyncHave>>,
    /// Changes already pushed in this session.
    sent_hashes: BTreeSet<ChangeHash>,
    /// Heads advertised in our last outbound message.
    last_sent_heads: Vec<ChangeHash>,
}

impl SyncState {
    pub fn new() -> Self {
        SyncState::default()
    }
}

/// Decide what, if anything, to tell the peer. `None` means both sides are
/// quiescent from our point of view.
pub fn generate_sync_message(doc: &Document, state: &mut SyncState) -> Option<SyncMessage> {
    let backend = doc.backend();
    let our_heads = backend.get_heads();
    let their_heads = state.their_heads.clone();
    let our_need = backend.get_missing_deps(their_heads.as_deref().unwrap_or(&[]));

    let changes = changes_to_send(doc, state);

    let heads_unchanged = state.last_sent_heads == our_heads;
    let heads_equal = their_heads.as_deref() == Some(our_heads.as_slice());
    if heads_unchanged && heads_equal && changes.is_empty() && our_need.is_empty() {
        trace!("in sync with peer; nothing to send");
        return None;
    }

    let bloom = BloomFilter::from_hashes(
        backend.get_all_changes().iter().map(|stored| &stored.hash),
        backend.limits().bloom_bits_per_entry,
    );
    let have = vec![SyncHave {
        last_sync: our_heads.clone(),
        bloom,
    }];

    for change in &changes {
        state
            .sent_hashes
            .insert(plait_core::sha256_bytes(change));
    }
    state.last_sent_heads = our_heads.clone();

    debug!(
        heads = our_heads.len(),
        need = our_need.len(),
        changes = changes.len(),
        "generated sync message"
    );
    Some(SyncMessage {
        heads: our_heads,
        need: our_need,
        have,
        changes,
    })
}

/// Changes the peer is missing by our best estimate: not probably in any of
/// their Bloom filters or explicitly needed, minus what we already sent.
/// Capped at the configured batch size; the rest goes next round.
fn changes_to_send(doc: &Document, state: &SyncState) -> Vec<Bytes> {
    let backend = doc.backend();
    let max_changes = backend.limits().max_changes_per_message;

    let explicit: BTreeSet<ChangeHash> = state.their_need.iter().copied().collect();
    let Some(their_have) = &state.their_have else {
        // Before their first have we only answer explicit requests.
        return state
            .their_need
            .iter()
            .filter(|hash| !state.sent_hashes.contains(hash))
            .filter_map(|hash| backend.get_change_by_hash(hash))
            .take(max_changes)
            .map(|stored| stored.bytes.clone())
            .collect();
    };

    // Changes reachable from anchors we hold locally are definitely theirs
    // already; the rest get tested against their filters.
    let mut candidates: Vec<&plait_core::StoredChange> = Vec::new();
    let anchors: Vec<ChangeHash> = their_have
        .iter()
        .flat_map(|have| have.last_sync.iter().copied())
        .filter(|anchor| backend.contains_change(anchor))
        .collect();
    let unreached = backend
        .get_changes(&anchors)
        .expect("anchors filtered to known hashes");
    for stored in unreached {
        let probably_theirs = their_have
            .iter()
            .any(|have| have.bloom.probably_contains(&stored.hash));
        if !probably_theirs || explicit.contains(&stored.hash) {
            candidates.push(stored);
        }
    }

    candidates
        .into_iter()
        .filter(|stored| !state.sent_hashes.contains(&stored.hash))
        .take(max_changes)
        .map(|stored| stored.bytes.clone())
        .collect()
}

/// Fold a peer message into the document and the sync state. Returns the
/// patch when any change actually applied.
pub fn receive_sync_message(
    doc: &mut Document,
    state: &mut SyncState,
    message: SyncMessage,
) -> Result<Option<Patch>, SyncError> {
    let patch = if message.changes.is_empty() {
        None
    } else {
        debug!(changes = message.changes.len(), "received changes");
        Some(doc.apply_encoded_changes(&message.changes)?)
    };

    let our_heads = doc.get_heads();
    if message.heads == our_heads {
        // Implicit ack: they have caught up with everything we sent.
        state.shared_heads = our_heads;
    } else {
        state.shared_heads = message
            .heads
            .iter()
            .filter(|head| doc.contains_change(head))
            .copied()
            .collect();
    }
    // A need for something we already pushed means the push was lost;
    // clearing it from sent_hashes lets the next message carry it again.
    for hash in &message.need {
        state.sent_hashes.remove(hash);
    }
    state.their_heads = Some(message.heads);
    state.their_need = message.need;
    state.their_have = Some(message.have);

    Ok(patch)
}

/// Both directions until neither side has anything to say. Test helper for
/// in-process replicas; transports drive the same loop across a wire.
pub fn sync_to_quiescence(
    a: &mut Document,
    a_state: &mut SyncState,
    b: &mut Document,
    b_state: &mut SyncState,
) -> Result<(), SyncError> {
    loop {
        let a_msg = generate_sync_message(a, a_state);
        let b_msg = generate_sync_message(b, b_state);
        if a_msg.is_none() && b_msg.is_none() {
            return Ok(());
        }
        if let Some(msg) = a_msg {
            let msg = SyncMessage::decode(&msg.encode())?;
            receive_sync_message(b, b_state, msg)?;
        }
        if let Some(msg) = b_msg {
            let msg = SyncMessage::decode(&msg.encode())?;
            receive_sync_message(a, a_state, msg)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plait_core::{ActorId, ObjId};

    fn doc(byte: u8) -> Document {
        Document::with_actor(ActorId::from_bytes(vec![byte]).unwrap())
    }

    #[test]
    fn first_message_advertises_heads_without_changes() {
        let mut a = doc(1);
        a.change(None, |tx| tx.set(&ObjId::Root, "bird", "magpie"))
            .unwrap();
        let mut state = SyncState::new();
        let msg = generate_sync_message(&a, &mut state).unwrap();
        assert_eq!(msg.heads, a.get_heads());
        assert!(msg.changes.is_empty());
        assert_eq!(msg.have.len(), 1);
    }

    #[test]
    fn quiescent_peers_generate_nothing() {
        let mut a = doc(1);
        let mut b = doc(2);
        a.change(None, |tx| tx.set(&ObjId::Root, "bird", "magpie"))
            .unwrap();
        let mut a_state = SyncState::new();
        let mut b_state = SyncState::new();
        sync_to_quiescence(&mut a, &mut a_state, &mut b, &mut b_state).unwrap();

        assert_eq!(a.get_heads(), b.get_heads());
        assert!(generate_sync_message(&a, &mut a_state).is_none());
        assert!(generate_sync_message(&b, &mut b_state).is_none());
    }

    #[test]
    fn sent_hashes_are_not_resent() {
        let mut a = doc(1);
        let mut b = doc(2);
        a.change(None, |tx| tx.set(&ObjId::Root, "bird", "magpie"))
            .unwrap();
        let mut a_state = SyncState::new();
        let mut b_state = SyncState::new();

        // b tells a what it has (nothing); a responds with the change.
        let b_msg = generate_sync_message(&b, &mut b_state).unwrap();
        receive_sync_message(&mut a, &mut a_state, b_msg).unwrap();
        let a_msg = generate_sync_message(&a, &mut a_state).unwrap();
        assert_eq!(a_msg.changes.len(), 1);

        // Regenerating before any reply does not repeat the change.
        let again = generate_sync_message(&a, &mut a_state);
        assert!(again.map_or(true, |msg| msg.changes.is_empty()));
    }

    #[test]
    fn explicit_need_is_served() {
        let mut a = doc(1);
        let mut b = doc(2);
        a.change(None, |tx| tx.set(&ObjId::Root, "bird", "magpie"))
            .unwrap();
        let hash = a.get_heads()[0];

        let mut a_state = SyncState::new();
        a_state.their_heads = Some(vec![]);
        a_state.their_need = vec![hash];
        a_state.their_have = Some(vec![SyncHave {
            last_sync: vec![],
            bloom: BloomFilter::from_hashes([hash].iter(), 10),
        }]);

        // Even though the bloom claims they have it, the explicit need
        // wins.
        let msg = generate_sync_message(&a, &mut a_state).unwrap();
        assert_eq!(msg.changes.len(), 1);
        let mut b_state = SyncState::new();
        receive_sync_message(&mut b, &mut b_state, msg).unwrap();
        assert_eq!(b.get_heads(), a.get_heads());
    }
}
