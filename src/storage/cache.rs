//! DashMap read cache in front of a store.
//!
//! Reads check the cache first and fill it on a miss. Writes go to the
//! inner store and update the cache only after the store accepted them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use super::{LedgerStore, StoreError, StoredTransaction};
use crate::protocol::{Account, Block, StateChange, Transaction};
use crate::receipts::TransactionReceipt;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub accounts: usize,
    pub blocks: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
pub struct FastCache {
    accounts: DashMap<String, Account>,
    blocks: DashMap<String, Block>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FastCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_account(&self, address: &str) -> Option<Account> {
        self.record(self.accounts.get(address).map(|a| a.value().clone()))
    }

    pub fn put_account(&self, account: &Account) {
        self.accounts.insert(account.address.clone(), account.clone());
    }

    pub fn get_block(&self, hash: &str) -> Option<Block> {
        self.record(self.blocks.get(hash).map(|b| b.value().clone()))
    }

    pub fn put_block(&self, block: &Block) {
        self.blocks.insert(block.hash().to_string(), block.clone());
    }

    pub fn clear(&self) {
        self.accounts.clear();
        self.blocks.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            accounts: self.accounts.len(),
            blocks: self.blocks.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn record<T>(&self, found: Option<T>) -> Option<T> {
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }
}

/// A store with a [`FastCache`] in front of account and block reads
pub struct CachedStore<S> {
    inner: S,
    cache: Arc<FastCache>,
}

impl<S: LedgerStore> CachedStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, cache: Arc::new(FastCache::new()) }
    }

    pub fn cache(&self) -> &Arc<FastCache> {
        &self.cache
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: LedgerStore> LedgerStore for CachedStore<S> {
    fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
        self.inner.upsert_account(account)?;
        self.cache.put_account(account);
        Ok(())
    }

    fn upsert_accounts(&self, accounts: &[Account]) -> Result<(), StoreError> {
        self.inner.upsert_accounts(accounts)?;
        for account in accounts {
            self.cache.put_account(account);
        }
        Ok(())
    }

    fn append_state_changes(&self, changes: &[StateChange]) -> Result<(), StoreError> {
        self.inner.append_state_changes(changes)
    }

    fn append_block(&self, block: &Block) -> Result<(), StoreError> {
        self.inner.append_block(block)?;
        self.cache.put_block(block);
        Ok(())
    }

    fn append_transaction(&self, tx: &Transaction, block_height: u64) -> Result<(), StoreError> {
        self.inner.append_transaction(tx, block_height)
    }

    fn append_receipts(&self, receipts: &[TransactionReceipt]) -> Result<(), StoreError> {
        self.inner.append_receipts(receipts)
    }

    fn get_account(&self, address: &str) -> Result<Option<Account>, StoreError> {
        if let Some(account) = self.cache.get_account(address) {
            return Ok(Some(account));
        }
        let account = self.inner.get_account(address)?;
        if let Some(account) = &account {
            self.cache.put_account(account);
        }
        Ok(account)
    }

    fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        self.inner.get_block_by_height(height)
    }

    fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, StoreError> {
        if let Some(block) = self.cache.get_block(hash) {
            return Ok(Some(block));
        }
        let block = self.inner.get_block_by_hash(hash)?;
        if let Some(block) = &block {
            self.cache.put_block(block);
        }
        Ok(block)
    }

    fn get_transaction(&self, hash: &str) -> Result<Option<StoredTransaction>, StoreError> {
        self.inner.get_transaction(hash)
    }

    fn get_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, StoreError> {
        self.inner.get_receipt(tx_hash)
    }

    fn state_change_count(&self) -> Result<u64, StoreError> {
        self.inner.state_change_count()
    }

    fn latest_height(&self) -> Result<Option<u64>, StoreError> {
        self.inner.latest_height()
    }
}
