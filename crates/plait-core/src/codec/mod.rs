//! Bit-exact columnar encoding of changes and whole documents.
//!
//! Chunk framing: magic `85 6f 4a 83`, one chunk-type byte (`1` change,
//! `0` document), four-byte big-endian payload length, payload. The change
//! hash is SHA-256 over the entire chunk.

use bytes::Bytes;
use thiserror::Error;

pub mod column;
pub mod leb;

mod change_chunk;
mod doc_chunk;

pub use change_chunk::{decode_change, encode_change};
pub use doc_chunk::{decode_document, encode_document};

use leb::Reader;

pub const MAGIC: [u8; 4] = [0x85, 0x6f, 0x4a, 0x83];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkType {
    Document = 0,
    Change = 1,
}

impl ChunkType {
    fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0 => Ok(ChunkType::Document),
            1 => Ok(ChunkType::Change),
            other => Err(DecodeError::UnknownChunkType { got: other }),
        }
    }
}

/// Corrupt or unintelligible bytes. Decoding never mutates state, so every
/// variant is safe to surface directly to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unknown chunk type {got}")]
    UnknownChunkType { got: u8 },
    #[error("expected {expected:?} chunk, got {got:?}")]
    WrongChunkType { expected: ChunkType, got: ChunkType },
    #[error("chunk truncated")]
    Truncated,
    #[error("trailing bytes after chunk")]
    TrailingBytes,
    #[error("LEB128 value out of range")]
    Leb128Overflow,
    #[error("invalid UTF-8 in string cell")]
    BadUtf8,
    #[error("unknown column id {id}")]
    UnknownColumn { id: u64 },
    #[error("unknown action code {code}")]
    UnknownAction { code: u64 },
    #[error("unknown value type code {code}")]
    UnknownValueCode { code: u64 },
    #[error("row {row}: actor index {index} out of range")]
    BadActorIndex { row: usize, index: u64 },
    #[error("row {row}: {reason}")]
    BadRow { row: usize, reason: &'static str },
    #[error("change hash mismatch: index says {expected}, chunk hashes to {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("document actor table does not cover change actors")]
    ActorTableMismatch,
    #[error("document references dependency {hash} it does not contain")]
    IncompleteDocument { hash: String },
}

pub(crate) fn encode_chunk(chunk_type: ChunkType, payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(MAGIC.len() + 5 + payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(chunk_type as u8);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

/// Split a chunk into its type and payload, rejecting trailing garbage.
pub(crate) fn parse_chunk(bytes: &[u8]) -> Result<(ChunkType, &[u8]), DecodeError> {
    let mut r = Reader::new(bytes);
    if r.read_bytes(4)? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let chunk_type = ChunkType::from_byte(r.read_u8()?)?;
    let len_bytes: [u8; 4] = r.read_bytes(4)?.try_into().expect("4-byte slice");
    let len = u32::from_be_bytes(len_bytes) as usize;
    if r.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    if r.remaining() > len {
        return Err(DecodeError::TrailingBytes);
    }
    Ok((chunk_type, r.read_bytes(len)?))
}
