//! Peer-to-peer synchronisation for plait documents.
//!
//! Two replicas converge by exchanging `SyncMessage`s: heads, explicit
//! need sets, Bloom filters over their change hashes, and the changes the
//! peer probably lacks. `DocSet` + `Connection` multiplex the exchange
//! over one message channel for many documents.

#![forbid(unsafe_code)]

pub mod bloom;
pub mod connection;
pub mod docset;
pub mod message;
pub mod state;

pub use bloom::BloomFilter;
pub use connection::{Connection, ConnectionError};
pub use docset::{DocId, DocSet, InvalidDocId};
pub use message::{MessageDecodeError, SyncHave, SyncMessage};
pub use state::{
    generate_sync_message, receive_sync_message, sync_to_quiescence, SyncError, SyncState,
};
