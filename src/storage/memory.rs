//! In-memory store, used when no data directory is configured and in tests.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::{LedgerStore, StoreError, StoredTransaction};
use crate::protocol::{Account, Block, StateChange, Transaction};
use crate::receipts::TransactionReceipt;

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<String, Account>,
    state_changes: Vec<StateChange>,
    blocks: HashMap<String, Block>,
    heights: BTreeMap<u64, String>,
    transactions: HashMap<String, StoredTransaction>,
    receipts: HashMap<String, TransactionReceipt>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account_count(&self) -> usize {
        self.tables.read().accounts.len()
    }
}

impl LedgerStore for MemoryStore {
    fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
        self.tables
            .write()
            .accounts
            .insert(account.address.clone(), account.clone());
        Ok(())
    }

    fn append_state_changes(&self, changes: &[StateChange]) -> Result<(), StoreError> {
        self.tables.write().state_changes.extend_from_slice(changes);
        Ok(())
    }

    fn append_block(&self, block: &Block) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        tables.heights.insert(block.height(), block.hash().to_string());
        tables.blocks.insert(block.hash().to_string(), block.clone());
        Ok(())
    }

    fn append_transaction(&self, tx: &Transaction, block_height: u64) -> Result<(), StoreError> {
        self.tables.write().transactions.insert(
            tx.hash.clone(),
            StoredTransaction { transaction: tx.clone(), block_height },
        );
        Ok(())
    }

    fn append_receipts(&self, receipts: &[TransactionReceipt]) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        for receipt in receipts {
            tables
                .receipts
                .insert(receipt.transaction_hash.clone(), receipt.clone());
        }
        Ok(())
    }

    fn get_account(&self, address: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.tables.read().accounts.get(address).cloned())
    }

    fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .heights
            .get(&height)
            .and_then(|hash| tables.blocks.get(hash))
            .cloned())
    }

    fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, StoreError> {
        Ok(self.tables.read().blocks.get(hash).cloned())
    }

    fn get_transaction(&self, hash: &str) -> Result<Option<StoredTransaction>, StoreError> {
        Ok(self.tables.read().transactions.get(hash).cloned())
    }

    fn get_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, StoreError> {
        Ok(self.tables.read().receipts.get(tx_hash).cloned())
    }

    fn state_change_count(&self) -> Result<u64, StoreError> {
        Ok(self.tables.read().state_changes.len() as u64)
    }

    fn latest_height(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.tables.read().heights.keys().next_back().copied())
    }
}
