//! Durable store on redb.
//!
//! Every table holds JSON-encoded typed records. Blocks are keyed by hash;
//! a separate height table points each height at the current main-chain
//! block, so a reorganization rewrites the pointer and keeps the old block.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use super::{LedgerStore, StoreError, StoredTransaction};
use crate::protocol::{Account, Block, StateChange, Transaction};
use crate::receipts::TransactionReceipt;

/// String key → JSON record
type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Address → Account
const ACCOUNTS: JsonTable = TableDefinition::new("accounts");

/// Block hash → Block
const BLOCKS: JsonTable = TableDefinition::new("blocks");

/// Height → main-chain block hash
const HEIGHTS: TableDefinition<u64, &str> = TableDefinition::new("heights");

/// Tx hash → StoredTransaction
const TRANSACTIONS: JsonTable = TableDefinition::new("transactions");

/// Tx hash → TransactionReceipt
const RECEIPTS: JsonTable = TableDefinition::new("receipts");

/// Sequence → StateChange
const STATE_CHANGES: TableDefinition<u64, &[u8]> = TableDefinition::new("state_changes");

/// Counters
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const STATE_CHANGE_COUNT: &str = "state_change_count";

pub const DATABASE_FILE: &str = "ledger.redb";

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Create or open `<dir>/ledger.redb`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DATABASE_FILE);
        info!(path = %path.display(), "Opening ledger database");

        let db = Database::create(&path).map_err(StoreError::backend)?;

        // Create every table up front so reads never hit a missing table
        let txn = db.begin_write().map_err(StoreError::backend)?;
        {
            let _ = txn.open_table(ACCOUNTS).map_err(StoreError::backend)?;
            let _ = txn.open_table(BLOCKS).map_err(StoreError::backend)?;
            let _ = txn.open_table(HEIGHTS).map_err(StoreError::backend)?;
            let _ = txn.open_table(TRANSACTIONS).map_err(StoreError::backend)?;
            let _ = txn.open_table(RECEIPTS).map_err(StoreError::backend)?;
            let _ = txn.open_table(STATE_CHANGES).map_err(StoreError::backend)?;
            let _ = txn.open_table(METADATA).map_err(StoreError::backend)?;
        }
        txn.commit().map_err(StoreError::backend)?;

        Ok(Self { db })
    }

    fn put_json<T: Serialize>(
        &self,
        table: JsonTable,
        entries: &[(&str, &T)],
    ) -> Result<(), StoreError> {
        let encoded: Vec<(&str, Vec<u8>)> = entries
            .iter()
            .map(|(key, value)| Ok((*key, serde_json::to_vec(value)?)))
            .collect::<Result<_, StoreError>>()?;

        let txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table = txn.open_table(table).map_err(StoreError::backend)?;
            for (key, bytes) in &encoded {
                table.insert(*key, bytes.as_slice()).map_err(StoreError::backend)?;
            }
        }
        txn.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let txn = self.db.begin_read().map_err(StoreError::backend)?;
        let table = txn.open_table(table).map_err(StoreError::backend)?;
        let Some(guard) = table.get(key).map_err(StoreError::backend)? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(guard.value())?;
        Ok(Some(record))
    }
}

impl LedgerStore for RedbStore {
    fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
        self.put_json(ACCOUNTS, &[(account.address.as_str(), account)])
    }

    fn upsert_accounts(&self, accounts: &[Account]) -> Result<(), StoreError> {
        let entries: Vec<(&str, &Account)> =
            accounts.iter().map(|a| (a.address.as_str(), a)).collect();
        self.put_json(ACCOUNTS, &entries)
    }

    fn append_state_changes(&self, changes: &[StateChange]) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let encoded = changes
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<Vec<_>, _>>()?;

        let txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut meta = txn.open_table(METADATA).map_err(StoreError::backend)?;
            let start = meta
                .get(STATE_CHANGE_COUNT)
                .map_err(StoreError::backend)?
                .map(|v| v.value())
                .unwrap_or(0);

            let mut table = txn.open_table(STATE_CHANGES).map_err(StoreError::backend)?;
            for (offset, bytes) in encoded.iter().enumerate() {
                table
                    .insert(start + offset as u64, bytes.as_slice())
                    .map_err(StoreError::backend)?;
            }
            meta.insert(STATE_CHANGE_COUNT, start + encoded.len() as u64)
                .map_err(StoreError::backend)?;
        }
        txn.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    fn append_block(&self, block: &Block) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(block)?;
        let txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut blocks = txn.open_table(BLOCKS).map_err(StoreError::backend)?;
            blocks
                .insert(block.hash(), bytes.as_slice())
                .map_err(StoreError::backend)?;
            let mut heights = txn.open_table(HEIGHTS).map_err(StoreError::backend)?;
            heights
                .insert(block.height(), block.hash())
                .map_err(StoreError::backend)?;
        }
        txn.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    fn append_transaction(&self, tx: &Transaction, block_height: u64) -> Result<(), StoreError> {
        let stored = StoredTransaction { transaction: tx.clone(), block_height };
        self.put_json(TRANSACTIONS, &[(tx.hash.as_str(), &stored)])
    }

    fn append_receipts(&self, receipts: &[TransactionReceipt]) -> Result<(), StoreError> {
        let entries: Vec<(&str, &TransactionReceipt)> = receipts
            .iter()
            .map(|r| (r.transaction_hash.as_str(), r))
            .collect();
        self.put_json(RECEIPTS, &entries)
    }

    fn get_account(&self, address: &str) -> Result<Option<Account>, StoreError> {
        self.get_json(ACCOUNTS, address)
    }

    fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        let hash = {
            let txn = self.db.begin_read().map_err(StoreError::backend)?;
            let heights = txn.open_table(HEIGHTS).map_err(StoreError::backend)?;
            let value = heights.get(height).map_err(StoreError::backend)?;
            value.map(|guard| guard.value().to_string())
        };
        match hash {
            Some(hash) => self.get_block_by_hash(&hash),
            None => Ok(None),
        }
    }

    fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, StoreError> {
        self.get_json(BLOCKS, hash)
    }

    fn get_transaction(&self, hash: &str) -> Result<Option<StoredTransaction>, StoreError> {
        self.get_json(TRANSACTIONS, hash)
    }

    fn get_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, StoreError> {
        self.get_json(RECEIPTS, tx_hash)
    }

    fn state_change_count(&self) -> Result<u64, StoreError> {
        let txn = self.db.begin_read().map_err(StoreError::backend)?;
        let meta = txn.open_table(METADATA).map_err(StoreError::backend)?;
        let value = meta.get(STATE_CHANGE_COUNT).map_err(StoreError::backend)?;
        Ok(value.map(|v| v.value()).unwrap_or(0))
    }

    fn latest_height(&self) -> Result<Option<u64>, StoreError> {
        let txn = self.db.begin_read().map_err(StoreError::backend)?;
        let heights = txn.open_table(HEIGHTS).map_err(StoreError::backend)?;
        let last = heights.last().map_err(StoreError::backend)?;
        Ok(last.map(|(height, _)| height.value()))
    }
}
