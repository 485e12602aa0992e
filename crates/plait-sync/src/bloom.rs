//! Bloom filter over change hashes.
//!
//! Fixed k = 7 probes, derived by splitting the SHA-256 of the change hash
//! into seven little-endian 32-bit lanes reduced modulo the bit size.
//! False positives only ever withhold a change; a withheld change comes
//! back as an explicit need next round, so sync always terminates.

use plait_core::codec::leb::{write_uleb, Reader};
use plait_core::codec::DecodeError;
use plait_core::{sha256_bytes, ChangeHash};

pub const NUM_PROBES: usize = 7;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    num_bits: u64,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// An empty filter sized for `expected_entries` at `bits_per_entry`
    /// density (10 bits with 7 probes targets roughly 1% FPR).
    pub fn new(expected_entries: usize, bits_per_entry: usize) -> Self {
        let num_bits = ((expected_entries * bits_per_entry) as u64).max(8);
        let bytes = num_bits.div_ceil(8) as usize;
        BloomFilter {
            num_bits,
            bits: vec![0; bytes],
        }
    }

    pub fn from_hashes<'a, I>(hashes: I, bits_per_entry: usize) -> Self
    where
        I: IntoIterator<Item = &'a ChangeHash>,
    {
        let hashes: Vec<&ChangeHash> = hashes.into_iter().collect();
        let mut filter = BloomFilter::new(hashes.len(), bits_per_entry);
        for hash in hashes {
            filter.insert(hash);
        }
        filter
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    fn probes(&self, hash: &ChangeHash) -> [u64; NUM_PROBES] {
        let digest = sha256_bytes(hash.as_bytes());
        let mut probes = [0u64; NUM_PROBES];
        for (i, probe) in probes.iter_mut().enumerate() {
            let lane: [u8; 4] = digest.as_bytes()[i * 4..i * 4 + 4]
                .try_into()
                .expect("4-byte lane");
            *probe = u64::from(u32::from_le_bytes(lane)) % self.num_bits;
        }
        probes
    }

    pub fn insert(&mut self, hash: &ChangeHash) {
        for bit in self.probes(hash) {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    pub fn probably_contains(&self, hash: &ChangeHash) -> bool {
        self.probes(hash)
            .iter()
            .all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    /// Bit-exact encoding: LEB128 bit size, then the bit bytes.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        write_uleb(buf, self.num_bits);
        buf.extend_from_slice(&self.bits);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let num_bits = r.read_uleb()?;
        if num_bits == 0 {
            return Err(DecodeError::Leb128Overflow);
        }
        let bytes = usize::try_from(num_bits.div_ceil(8)).map_err(|_| DecodeError::Leb128Overflow)?;
        let bits = r.read_bytes(bytes)?.to_vec();
        Ok(BloomFilter { num_bits, bits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> ChangeHash {
        ChangeHash([byte; 32])
    }

    #[test]
    fn inserted_hashes_are_found() {
        let hashes: Vec<ChangeHash> = (0..50).map(hash).collect();
        let filter = BloomFilter::from_hashes(hashes.iter(), 10);
        for h in &hashes {
            assert!(filter.probably_contains(h));
        }
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(0, 10);
        assert!(!filter.probably_contains(&hash(1)));
    }

    #[test]
    fn false_positive_rate_is_plausible() {
        let present: Vec<ChangeHash> = (0..100).map(hash).collect();
        let filter = BloomFilter::from_hashes(present.iter(), 10);
        let false_positives = (100..=255)
            .map(hash)
            .filter(|h| filter.probably_contains(h))
            .count();
        // ~1% expected over 156 absent entries; 10 is a generous bound.
        assert!(false_positives <= 10, "got {false_positives}");
    }

    #[test]
    fn encoding_round_trips() {
        let filter = BloomFilter::from_hashes((0..20).map(hash).collect::<Vec<_>>().iter(), 10);
        let mut buf = Vec::new();
        filter.encode_into(&mut buf);
        let decoded = BloomFilter::decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(decoded, filter);
    }
}
