// ============================================================================
// STORAGE LAYER
// ============================================================================
//
// Durable mirror of the ledger. The in-memory ledger is authoritative; the
// store receives committed blocks after the fact through the persister.
//
// ┌────────────────┐  PersistJob   ┌───────────┐      ┌──────────────────┐
// │ BlockProducer  │ ────────────▶ │ Persister │ ───▶ │ dyn LedgerStore  │
// │ / Node import  │   (mpsc)      │ (task)    │      │  MemoryStore     │
// └────────────────┘               └───────────┘      │  RedbStore       │
//                                                     │  CachedStore<S>  │
//                                                     └──────────────────┘
//
// Accounts are upserted (idempotent). Blocks, transactions, receipts and
// state changes are append-only. Values are typed records encoded as JSON.
//
// ============================================================================

pub mod cache;
pub mod memory;
pub mod persister;
pub mod redb_store;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{Account, Block, StateChange, Transaction};
use crate::receipts::TransactionReceipt;

pub use cache::{CachedStore, FastCache};
pub use memory::MemoryStore;
pub use persister::{PersistJob, Persister};
pub use redb_store::RedbStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Storage io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// A transaction as stored, with the height of the block that included it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub transaction: Transaction,
    pub block_height: u64,
}

pub trait LedgerStore: Send + Sync {
    fn upsert_account(&self, account: &Account) -> Result<(), StoreError>;

    fn upsert_accounts(&self, accounts: &[Account]) -> Result<(), StoreError> {
        for account in accounts {
            self.upsert_account(account)?;
        }
        Ok(())
    }

    fn append_state_changes(&self, changes: &[StateChange]) -> Result<(), StoreError>;

    /// Store a block by hash and point its height at it
    fn append_block(&self, block: &Block) -> Result<(), StoreError>;

    fn append_transaction(&self, tx: &Transaction, block_height: u64) -> Result<(), StoreError>;

    fn append_receipts(&self, receipts: &[TransactionReceipt]) -> Result<(), StoreError>;

    fn get_account(&self, address: &str) -> Result<Option<Account>, StoreError>;

    fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError>;

    fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, StoreError>;

    fn get_transaction(&self, hash: &str) -> Result<Option<StoredTransaction>, StoreError>;

    fn get_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, StoreError>;

    fn state_change_count(&self) -> Result<u64, StoreError>;

    /// Highest height a block was stored at
    fn latest_height(&self) -> Result<Option<u64>, StoreError>;
}
