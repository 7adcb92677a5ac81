//! 2048-bit log bloom filter.
//!
//! Each item sets 3 bits taken from the first 6 bytes of its SHA-256:
//! bit i = (h[2i] << 8 | h[2i+1]) mod 2048. False positives are possible,
//! false negatives are not.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::sha256;

pub const BLOOM_BITS: usize = 2048;
pub const BLOOM_BYTES: usize = BLOOM_BITS / 8;
const BITS_PER_ITEM: usize = 3;

#[derive(Clone, PartialEq, Eq)]
pub struct LogsBloom([u8; BLOOM_BYTES]);

impl Default for LogsBloom {
    fn default() -> Self {
        Self([0u8; BLOOM_BYTES])
    }
}

impl LogsBloom {
    pub fn new() -> Self {
        Self::default()
    }

    fn bit_positions(item: &str) -> [usize; BITS_PER_ITEM] {
        let hash = sha256(item.as_bytes());
        let mut positions = [0usize; BITS_PER_ITEM];
        for (i, position) in positions.iter_mut().enumerate() {
            let raw = (hash[i * 2] as usize) << 8 | hash[i * 2 + 1] as usize;
            *position = raw % BLOOM_BITS;
        }
        positions
    }

    pub fn add(&mut self, item: &str) {
        for position in Self::bit_positions(item) {
            self.0[position / 8] |= 1 << (position % 8);
        }
    }

    /// `false` means definitely absent
    pub fn contains(&self, item: &str) -> bool {
        Self::bit_positions(item)
            .iter()
            .all(|&position| self.0[position / 8] & (1 << (position % 8)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Union with another filter
    pub fn accrue(&mut self, other: &LogsBloom) {
        for (ours, theirs) in self.0.iter_mut().zip(other.0.iter()) {
            *ours |= theirs;
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; BLOOM_BYTES];
        hex::decode_to_slice(text, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for LogsBloom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: u32 = self.0.iter().map(|b| b.count_ones()).sum();
        write!(f, "LogsBloom({} bits set)", set)
    }
}

impl Serialize for LogsBloom {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for LogsBloom {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Add `item` to a hex-encoded bloom, returning the new encoding
pub fn bloom_add(bloom_hex: &str, item: &str) -> Result<String, hex::FromHexError> {
    let mut bloom = LogsBloom::from_hex(bloom_hex)?;
    bloom.add(item);
    Ok(bloom.to_hex())
}

/// Membership test against a hex-encoded bloom. Malformed input is "absent".
pub fn bloom_contains(bloom_hex: &str, item: &str) -> bool {
    LogsBloom::from_hex(bloom_hex)
        .map(|bloom| bloom.contains(item))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_added_items_are_found() {
        let mut bloom = LogsBloom::new();
        for i in 0..50 {
            bloom.add(&format!("topic-{}", i));
        }
        for i in 0..50 {
            assert!(bloom.contains(&format!("topic-{}", i)));
        }
    }

    #[test]
    fn test_empty_bloom_contains_nothing() {
        let bloom = LogsBloom::new();
        assert!(bloom.is_empty());
        assert!(!bloom.contains("anything"));
        assert_eq!(bloom.to_hex().len(), BLOOM_BYTES * 2);
    }

    #[test]
    fn test_hex_helpers() {
        let empty = LogsBloom::new().to_hex();
        let with_item = bloom_add(&empty, "transfer").unwrap();
        assert!(bloom_contains(&with_item, "transfer"));
        assert!(!bloom_contains("zz", "transfer"));
    }

    #[test]
    fn test_at_most_three_bits_per_item() {
        let mut bloom = LogsBloom::new();
        bloom.add("x");
        let set: u32 = bloom.0.iter().map(|b| b.count_ones()).sum();
        assert!((1..=3).contains(&set));
    }
}
