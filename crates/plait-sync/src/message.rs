//! Sync message wire format.
//!
//! Magic byte `42`, version `0`, heads (sorted hash list), need (sorted
//! hash list), have entries (anchor heads + Bloom filter), then
//! length-prefixed change chunks.

use bytes::Bytes;
use thiserror::Error;

use plait_core::codec::leb::{write_uleb, Reader};
use plait_core::codec::DecodeError;
use plait_core::ChangeHash;

use crate::bloom::BloomFilter;

pub const MESSAGE_MAGIC: u8 = 0x42;
pub const MESSAGE_VERSION: u8 = 0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageDecodeError {
    #[error("bad sync message magic byte {got:#04x}")]
    BadMagic { got: u8 },
    #[error("unsupported sync message version {got}")]
    UnsupportedVersion { got: u8 },
    #[error(transparent)]
    Bytes(#[from] DecodeError),
}

/// One "I have" assertion: everything reachable from `last_sync`, plus
/// whatever the Bloom filter claims.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncHave {
    pub last_sync: Vec<ChangeHash>,
    pub bloom: BloomFilter,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncMessage {
    /// Sender's current heads.
    pub heads: Vec<ChangeHash>,
    /// Hashes the sender cannot satisfy locally.
    pub need: Vec<ChangeHash>,
    pub have: Vec<SyncHave>,
    /// Encoded change chunks being pushed.
    pub changes: Vec<Bytes>,
}

fn write_hashes(buf: &mut Vec<u8>, hashes: &[ChangeHash]) {
    let mut sorted: Vec<&ChangeHash> = hashes.iter().collect();
    sorted.sort_unstable();
    write_uleb(buf, sorted.len() as u64);
    for hash in sorted {
        buf.extend_from_slice(hash.as_bytes());
    }
}

fn read_hashes(r: &mut Reader<'_>) -> Result<Vec<ChangeHash>, DecodeError> {
    let count = r.read_usize()?;
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        let bytes: [u8; 32] = r.read_bytes(32)?.try_into().expect("32-byte slice");
        hashes.push(ChangeHash(bytes));
    }
    Ok(hashes)
}

impl SyncMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        buf.push(MESSAGE_MAGIC);
        buf.push(MESSAGE_VERSION);
        write_hashes(&mut buf, &self.heads);
        write_hashes(&mut buf, &self.need);
        write_uleb(&mut buf, self.have.len() as u64);
        for have in &self.have {
            write_hashes(&mut buf, &have.last_sync);
            have.bloom.encode_into(&mut buf);
        }
        write_uleb(&mut buf, self.changes.len() as u64);
        for change in &self.changes {
            write_uleb(&mut buf, change.len() as u64);
            buf.extend_from_slice(change);
        }
        Bytes::from(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<SyncMessage, MessageDecodeError> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u8()?;
        if magic != MESSAGE_MAGIC {
            return Err(MessageDecodeError::BadMagic { got: magic });
        }
        let version = r.read_u8()?;
        if version != MESSAGE_VERSION {
            return Err(MessageDecodeError::UnsupportedVersion { got: version });
        }
        let heads = read_hashes(&mut r)?;
        let need = read_hashes(&mut r)?;
        let num_have = r.read_usize()?;
        let mut have = Vec::with_capacity(num_have);
        for _ in 0..num_have {
            let last_sync = read_hashes(&mut r)?;
            let bloom = BloomFilter::decode(&mut r)?;
            have.push(SyncHave { last_sync, bloom });
        }
        let num_changes = r.read_usize()?;
        let mut changes = Vec::with_capacity(num_changes);
        for _ in 0..num_changes {
            let len = r.read_usize()?;
            changes.push(Bytes::copy_from_slice(r.read_bytes(len)?));
        }
        if !r.is_empty() {
            return Err(DecodeError::TrailingBytes.into());
        }
        Ok(SyncMessage {
            heads,
            need,
            have,
            changes,
        })
    }
}
