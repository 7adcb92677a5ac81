//! Shared helpers for protocol types.

use borsh::BorshSerialize;

// ============================================================================
// CANONICAL ENCODING
// ============================================================================

/// Borsh bytes of `value`, the canonical form hashed and signed everywhere
pub fn canonical_bytes<T: BorshSerialize>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    // Writing into a Vec<u8> cannot fail
    let _ = value.serialize(&mut buf);
    buf
}

// ============================================================================
// TIME
// ============================================================================

/// Wall clock in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ============================================================================
// DISPLAY
// ============================================================================

/// First 12 characters of a hash or address, for log lines
pub fn short(value: &str) -> &str {
    match value.char_indices().nth(12) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
