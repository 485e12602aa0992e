//! Whole-document encoding: every change in canonical order, plus a
//! dedup'd actor table and a hash index for integrity checking.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::change::{sha256_bytes, Change};
use crate::identity::ActorId;

use super::leb::{write_uleb, Reader};
use super::{encode_chunk, parse_chunk, ChunkType, DecodeError};

/// Encode a document from its changes. `changes` must already be in
/// canonical order (topological, ties by hash ascending); the history DAG
/// produces that order.
pub fn encode_document<'a, I>(changes: I) -> Bytes
where
    I: IntoIterator<Item = &'a Change>,
{
    let changes: Vec<&Change> = changes.into_iter().collect();

    let actors: BTreeSet<&ActorId> = changes.iter().map(|c| &c.actor).collect();
    let mut payload = Vec::new();
    write_uleb(&mut payload, actors.len() as u64);
    for actor in &actors {
        write_uleb(&mut payload, actor.as_bytes().len() as u64);
        payload.extend_from_slice(actor.as_bytes());
    }

    let chunks: Vec<Bytes> = changes.iter().map(|c| c.encode()).collect();
    write_uleb(&mut payload, chunks.len() as u64);
    for chunk in &chunks {
        payload.extend_from_slice(sha256_bytes(chunk).as_bytes());
    }
    for chunk in &chunks {
        write_uleb(&mut payload, chunk.len() as u64);
        payload.extend_from_slice(chunk);
    }

    encode_chunk(ChunkType::Document, &payload)
}

/// Decode a document into its changes, in stored (canonical) order.
///
/// Every embedded chunk is re-hashed against the index; a mismatch means
/// corruption and nothing is returned.
pub fn decode_document(bytes: &[u8]) -> Result<Vec<Change>, DecodeError> {
    let (chunk_type, payload) = parse_chunk(bytes)?;
    if chunk_type != ChunkType::Document {
        return Err(DecodeError::WrongChunkType {
            expected: ChunkType::Document,
            got: chunk_type,
        });
    }

    let mut r = Reader::new(payload);
    let num_actors = r.read_usize()?;
    let mut actors = BTreeSet::new();
    for _ in 0..num_actors {
        let len = r.read_usize()?;
        let bytes = r.read_bytes(len)?;
        actors.insert(bytes.to_vec());
    }

    let num_changes = r.read_usize()?;
    let mut hashes = Vec::with_capacity(num_changes);
    for _ in 0..num_changes {
        let bytes: [u8; 32] = r.read_bytes(32)?.try_into().expect("32-byte slice");
        hashes.push(crate::change::ChangeHash(bytes));
    }

    let mut changes = Vec::with_capacity(num_changes);
    for expected in hashes {
        let len = r.read_usize()?;
        let chunk = r.read_bytes(len)?;
        let actual = sha256_bytes(chunk);
        if actual != expected {
            return Err(DecodeError::HashMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        let change = Change::decode(chunk)?;
        if !actors.contains(change.actor.as_bytes()) {
            return Err(DecodeError::ActorTableMismatch);
        }
        changes.push(change);
    }
    if !r.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(changes)
}
