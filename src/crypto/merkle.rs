//! Pairwise-fold Merkle root.
//!
//! Shared by the state root, the transactions root and the receipts root.
//! Levels with an odd node count duplicate their last node. There are no
//! inclusion proofs; the root is recomputed in full on every call.

use sha2::{Digest, Sha256};

use super::{base58, sha256};

/// Fold leaves into a root. `None` when there are no leaves.
pub fn merkle_root(leaves: &[[u8; 32]]) -> Option<[u8; 32]> {
    if leaves.is_empty() {
        return None;
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                hasher.finalize().into()
            })
            .collect();
    }
    Some(level[0])
}

/// Base58 root of `leaves`, or the hash of `empty_label` for an empty set
pub fn merkle_root_or(leaves: &[[u8; 32]], empty_label: &str) -> String {
    match merkle_root(leaves) {
        Some(root) => base58::encode(&root),
        None => base58::encode(&sha256(empty_label.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(n: u8) -> [u8; 32] {
        sha256(&[n])
    }

    fn pair(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(a);
        hasher.update(b);
        hasher.finalize().into()
    }

    #[test]
    fn test_empty_and_single() {
        assert_eq!(merkle_root(&[]), None);
        assert_eq!(merkle_root(&[leaf(1)]), Some(leaf(1)));
        assert_eq!(
            merkle_root_or(&[], "empty_state"),
            base58::encode(&sha256(b"empty_state"))
        );
    }

    #[test]
    fn test_odd_count_duplicates_last() {
        let (a, b, c) = (leaf(1), leaf(2), leaf(3));
        let expected = pair(&pair(&a, &b), &pair(&c, &c));
        assert_eq!(merkle_root(&[a, b, c]), Some(expected));
    }

    #[test]
    fn test_order_matters() {
        let (a, b) = (leaf(1), leaf(2));
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }
}
