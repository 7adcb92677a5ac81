//! Ledger records: accounts, transactions, blocks and state changes.
//!
//! These are the typed records that cross every boundary in the crate,
//! including the persistence layer. Hashes and signatures are base58 text.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use super::helpers::canonical_bytes;
use crate::crypto::{self, merkle_root_or, CryptoError};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Parent hash of the genesis block (base58 of 32 zero bytes)
pub const GENESIS_PARENT_HASH: &str = "11111111111111111111111111111111";

/// Producer recorded on the genesis block
pub const GENESIS_PRODUCER: &str = "genesis";

// ============================================================================
// ACCOUNT
// ============================================================================

/// Account record. Created lazily on first credit or debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Account {
    pub address: String,
    pub balance: u128,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_root: Option<String>,
}

impl Account {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            balance: 0,
            nonce: 0,
            code_hash: None,
            storage_root: None,
        }
    }

    pub fn with_balance(address: impl Into<String>, balance: u128) -> Self {
        Self { balance, ..Self::new(address) }
    }

    /// Merkle leaf: SHA-256 over the canonical encoding of every field
    pub fn leaf_hash(&self) -> [u8; 32] {
        crypto::sha256(&canonical_bytes(self))
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

/// Transaction fields covered by the signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct UnsignedTransaction {
    pub from: String,
    pub to: String,
    pub value: u128,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub nonce: u64,
    #[serde(default)]
    pub data: Option<String>,
}

impl UnsignedTransaction {
    /// Canonical signing message (excludes hash and signature)
    pub fn signing_message(&self) -> Vec<u8> {
        canonical_bytes(self)
    }

    /// Sign with `private_key` and seal the content hash
    pub fn sign(self, private_key: &str) -> Result<Transaction, CryptoError> {
        let signature = crypto::sign(&self.signing_message(), private_key)?;
        let mut tx = Transaction {
            hash: String::new(),
            from: self.from,
            to: self.to,
            value: self.value,
            gas_price: self.gas_price,
            gas_limit: self.gas_limit,
            nonce: self.nonce,
            data: self.data,
            signature,
        };
        tx.hash = tx.compute_hash();
        Ok(tx)
    }
}

/// A signed transfer. `hash` is its identity and replay-protection key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub value: u128,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub nonce: u64,
    #[serde(default)]
    pub data: Option<String>,
    pub signature: String,
}

impl Transaction {
    pub fn unsigned(&self) -> UnsignedTransaction {
        UnsignedTransaction {
            from: self.from.clone(),
            to: self.to.clone(),
            value: self.value,
            gas_price: self.gas_price,
            gas_limit: self.gas_limit,
            nonce: self.nonce,
            data: self.data.clone(),
        }
    }

    pub fn signing_message(&self) -> Vec<u8> {
        self.unsigned().signing_message()
    }

    /// Content hash over the signing message and the signature
    pub fn compute_hash(&self) -> String {
        let mut bytes = self.signing_message();
        bytes.extend_from_slice(self.signature.as_bytes());
        crypto::hash_base58(&bytes)
    }

    /// The sender address is the verifying key
    pub fn verify_signature(&self) -> bool {
        crypto::verify(&self.signing_message(), &self.signature, &self.from)
    }

    /// Maximum fee this transaction can burn
    pub fn max_fee(&self) -> Option<u128> {
        self.gas_price.checked_mul(self.gas_limit as u128)
    }

    /// `value + gas_price * gas_limit`, `None` on overflow
    pub fn total_cost(&self) -> Option<u128> {
        self.max_fee()?.checked_add(self.value)
    }
}

// ============================================================================
// BLOCK
// ============================================================================

/// Block header. `hash` covers every other field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub parent_hash: String,
    pub producer: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub nonce: u64,
    pub difficulty: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub state_root: String,
    pub transactions_root: String,
    pub receipts_root: String,
    pub hash: String,
}

impl BlockHeader {
    pub fn compute_hash(&self) -> String {
        let mut unsealed = self.clone();
        unsealed.hash = String::new();
        crypto::hash_base58(&canonical_bytes(&unsealed))
    }

    /// Fill in `hash` from the current field values
    pub fn seal(&mut self) {
        self.hash = self.compute_hash();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> &str {
        &self.header.hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn parent_hash(&self) -> &str {
        &self.header.parent_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    /// True when the stored hash matches the header contents
    pub fn verify_hash(&self) -> bool {
        self.header.hash == self.header.compute_hash()
    }

    /// Merkle root over transaction hashes, in block order
    pub fn transactions_root(transactions: &[Transaction]) -> String {
        let leaves: Vec<[u8; 32]> = transactions
            .iter()
            .map(|tx| crypto::sha256(tx.hash.as_bytes()))
            .collect();
        merkle_root_or(&leaves, "empty_transactions")
    }

    /// Gas charged for `transactions`: the sum of their gas limits
    pub fn gas_for(transactions: &[Transaction]) -> u64 {
        transactions
            .iter()
            .fold(0u64, |acc, tx| acc.saturating_add(tx.gas_limit))
    }
}

// ============================================================================
// STATE CHANGE
// ============================================================================

/// Append-only audit record of a single balance/nonce mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct StateChange {
    pub address: String,
    pub previous_balance: u128,
    pub new_balance: u128,
    pub previous_nonce: u64,
    pub new_nonce: u64,
    pub block_height: u64,
    pub tx_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn transfer(keypair: &Keypair, to: &str) -> Transaction {
        UnsignedTransaction {
            from: keypair.public_key.clone(),
            to: to.to_string(),
            value: 100,
            gas_price: 1,
            gas_limit: 21_000,
            nonce: 0,
            data: None,
        }
        .sign(&keypair.private_key)
        .unwrap()
    }

    #[test]
    fn test_signed_transaction_verifies() {
        let alice = Keypair::from_seed(&[1u8; 32]);
        let bob = Keypair::from_seed(&[2u8; 32]);
        let tx = transfer(&alice, &bob.public_key);

        assert!(tx.verify_signature());
        assert_eq!(tx.hash, tx.compute_hash());
        assert_eq!(tx.total_cost(), Some(21_100));
    }

    #[test]
    fn test_tampered_field_fails_verification() {
        let alice = Keypair::from_seed(&[1u8; 32]);
        let bob = Keypair::from_seed(&[2u8; 32]);
        let mut tx = transfer(&alice, &bob.public_key);
        tx.value = 1_000;

        assert!(!tx.verify_signature());
        assert!(!tx.verify_signature(), "verification must be deterministic");
        assert_ne!(tx.hash, tx.compute_hash());
    }

    #[test]
    fn test_block_hash_covers_header() {
        let mut header = BlockHeader {
            height: 1,
            parent_hash: GENESIS_PARENT_HASH.to_string(),
            producer: "p".to_string(),
            timestamp: 1_000,
            nonce: 0,
            difficulty: 1,
            gas_used: 0,
            gas_limit: 30_000_000,
            state_root: "s".to_string(),
            transactions_root: Block::transactions_root(&[]),
            receipts_root: "r".to_string(),
            hash: String::new(),
        };
        header.seal();
        let block = Block { header: header.clone(), transactions: vec![] };
        assert!(block.verify_hash());

        let mut tampered = block.clone();
        tampered.header.state_root = "other".to_string();
        assert!(!tampered.verify_hash());
    }

    #[test]
    fn test_total_cost_overflow() {
        let alice = Keypair::from_seed(&[1u8; 32]);
        let mut tx = transfer(&alice, "x");
        tx.gas_price = u128::MAX;
        assert_eq!(tx.total_cost(), None);
    }
}
