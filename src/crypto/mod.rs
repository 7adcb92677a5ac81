//! Cryptographic identity: Ed25519 keys, base58 text codec, SHA-256 and
//! the Merkle fold used by every commitment in the ledger.

pub mod base58;
pub mod keys;
pub mod merkle;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::protocol::{Transaction, UnsignedTransaction};

pub use keys::{derive_public_key, generate_keypair, is_valid_address, sign, verify, Keypair};
pub use merkle::{merkle_root, merkle_root_or};

/// Errors from key handling and decoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Invalid base58 character '{character}' at position {position}")]
    InvalidBase58 { character: char, position: usize },

    #[error("Invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Base58-encoded SHA-256 digest
pub fn hash_base58(data: &[u8]) -> String {
    base58::encode(&sha256(data))
}

/// Encode bytes with the ledger's text codec
pub fn encode(bytes: &[u8]) -> String {
    base58::encode(bytes)
}

/// Decode text produced by [`encode`]
pub fn decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    base58::decode(text)
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// Bytes covered by a transaction signature
pub fn signing_message(tx: &Transaction) -> Vec<u8> {
    tx.signing_message()
}

/// Sign a transfer with `private_key`, filling in signature and hash
pub fn sign_transaction(unsigned: UnsignedTransaction, private_key: &str) -> Result<Transaction, CryptoError> {
    unsigned.sign(private_key)
}

pub fn transaction_hash(tx: &Transaction) -> String {
    tx.compute_hash()
}

/// Signature verifies against `from` and the hash matches the contents
pub fn verify_transaction(tx: &Transaction) -> bool {
    tx.hash == tx.compute_hash() && tx.verify_signature()
}
