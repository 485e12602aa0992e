//! Safety limits (normative defaults).

use serde::{Deserialize, Serialize};

/// Engine and sync limits. Values are explicit about their units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Cap on changes parked with unresolved deps; exceeding it is an
    /// error rather than unbounded memory growth.
    pub max_pending_changes: usize,
    /// Cap on changes shipped in one sync message; the remainder goes out
    /// on the next round.
    pub max_changes_per_message: usize,
    /// Bloom filter sizing: bits per expected entry (10 bits with 7
    /// probes gives roughly a 1% false-positive rate).
    pub bloom_bits_per_entry: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_pending_changes: 10_000,
            max_changes_per_message: 4_096,
            bloom_bits_per_entry: 10,
        }
    }
}
