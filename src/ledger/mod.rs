// ============================================================================
// LEDGER STATE STORE
// ============================================================================
//
// Authoritative address -> account mapping.
//
// ┌──────────────────────────────────────────────────────────────┐
// │  apply_transaction / apply_reward                            │
// │          │                                                   │
// │          ▼                                                   │
// │   ┌──────────────┐   commit()   ┌──────────────────────────┐ │
// │   │ Working set  │ ───────────▶ │ Committed accounts + root│ │
// │   │ (Mutex)      │              │ (RwLock)                 │ │
// │   └──────────────┘              └──────────────────────────┘ │
// │                                        ▲                     │
// │                            get_balance / get_nonce           │
// └──────────────────────────────────────────────────────────────┘
//
// CONCURRENCY MODEL:
// - Writers serialize on the working-set Mutex.
// - Readers only see committed state: either the pre-block or the
//   post-block accounts, never a half-applied block.
// - Lock order is always working -> committed.
//
// ============================================================================

pub mod genesis;

use std::collections::{BTreeMap, HashSet};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::merkle_root_or;
use crate::protocol::{short, Account, Block, StateChange, Transaction};

pub use genesis::{GenesisAllocation, GenesisConfig, INITIAL_SUPPLY};

/// Label hashed for the root of an empty account set
pub const EMPTY_STATE_LABEL: &str = "empty_state";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Insufficient balance: has {has}, needs {needs}")]
    InsufficientBalance { has: u128, needs: u128 },

    #[error("Invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("Balance overflow for {0}")]
    BalanceOverflow(String),

    #[error("Transaction {tx_hash} failed during replay: {reason}")]
    ReplayFailed { tx_hash: String, reason: String },

    #[error("State root mismatch at height {height}: block has {expected}, replay produced {actual}")]
    StateRootMismatch { height: u64, expected: String, actual: String },

    #[error("No committed state for height {height} (committed height {committed:?})")]
    HeightUnavailable { height: u64, committed: Option<u64> },
}

/// Result of a commit: the new root plus what changed
#[derive(Debug, Clone, Default)]
pub struct CommitSummary {
    pub block_height: u64,
    pub state_root: String,
    /// State changes recorded since the previous commit, in order
    pub changes: Vec<StateChange>,
    /// Post-commit records of every touched account
    pub accounts: Vec<Account>,
}

/// Point-in-time copy of committed state, used to roll back a block
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    accounts: BTreeMap<String, Account>,
    state_root: String,
    height: Option<u64>,
    history_len: usize,
}

impl LedgerSnapshot {
    pub fn state_root(&self) -> &str {
        &self.state_root
    }
}

#[derive(Debug)]
struct CommittedState {
    /// BTreeMap keeps accounts sorted by address for the state root
    accounts: BTreeMap<String, Account>,
    state_root: String,
    height: Option<u64>,
    history: Vec<StateChange>,
}

#[derive(Debug, Default)]
struct WorkingSet {
    /// Accounts touched since the last commit
    accounts: BTreeMap<String, Account>,
    changes: Vec<StateChange>,
}

impl WorkingSet {
    fn account(&self, committed: &CommittedState, address: &str) -> Account {
        self.accounts
            .get(address)
            .or_else(|| committed.accounts.get(address))
            .cloned()
            .unwrap_or_else(|| Account::new(address))
    }

    fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.changes.is_empty()
    }
}

/// The single-writer ledger
#[derive(Debug)]
pub struct LedgerState {
    committed: RwLock<CommittedState>,
    working: Mutex<WorkingSet>,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerState {
    /// Empty ledger with no committed height
    pub fn new() -> Self {
        Self {
            committed: RwLock::new(CommittedState {
                accounts: BTreeMap::new(),
                state_root: root_of(std::iter::empty()),
                height: None,
                history: Vec::new(),
            }),
            working: Mutex::new(WorkingSet::default()),
        }
    }

    /// Ledger seeded with the genesis allocation, committed at height 0
    pub fn from_genesis(genesis: &GenesisConfig) -> Result<Self, LedgerError> {
        let ledger = Self::new();
        ledger.reset_to(genesis)?;
        Ok(ledger)
    }

    // ========================================================================
    // READ OPERATIONS (committed state only)
    // ========================================================================

    pub fn get_balance(&self, address: &str) -> u128 {
        self.committed
            .read()
            .accounts
            .get(address)
            .map(|a| a.balance)
            .unwrap_or(0)
    }

    pub fn get_nonce(&self, address: &str) -> u64 {
        self.committed
            .read()
            .accounts
            .get(address)
            .map(|a| a.nonce)
            .unwrap_or(0)
    }

    pub fn get_account(&self, address: &str) -> Option<Account> {
        self.committed.read().accounts.get(address).cloned()
    }

    /// Root published by the last commit
    pub fn state_root(&self) -> String {
        self.committed.read().state_root.clone()
    }

    /// Height of the last commit, `None` before genesis
    pub fn committed_height(&self) -> Option<u64> {
        self.committed.read().height
    }

    /// Copy of all committed accounts, sorted by address
    pub fn accounts(&self) -> Vec<Account> {
        self.committed.read().accounts.values().cloned().collect()
    }

    pub fn account_count(&self) -> usize {
        self.committed.read().accounts.len()
    }

    /// Sum of committed balances (saturating)
    pub fn total_supply(&self) -> u128 {
        self.committed
            .read()
            .accounts
            .values()
            .fold(0u128, |acc, a| acc.saturating_add(a.balance))
    }

    /// Most recent committed state changes, newest last
    pub fn recent_state_changes(&self, limit: usize) -> Vec<StateChange> {
        let committed = self.committed.read();
        let start = committed.history.len().saturating_sub(limit);
        committed.history[start..].to_vec()
    }

    /// Committed state changes touching `address`, oldest first
    pub fn state_changes_for(&self, address: &str) -> Vec<StateChange> {
        self.committed
            .read()
            .history
            .iter()
            .filter(|c| c.address == address)
            .cloned()
            .collect()
    }

    pub fn has_uncommitted(&self) -> bool {
        !self.working.lock().is_empty()
    }

    // ========================================================================
    // WRITE OPERATIONS (serialized on the working set)
    // ========================================================================

    /// Apply a transfer to the working set.
    ///
    /// Checks, in order: the sender covers `value + gas_price * gas_limit`,
    /// then `tx.nonce` equals the sender nonce exactly. The full cost is
    /// debited, only `value` is credited; the fee is burned.
    pub fn apply_transaction(&self, tx: &Transaction, block_height: u64) -> Result<(), LedgerError> {
        let mut working = self.working.lock();
        let committed = self.committed.read();

        let mut sender = working.account(&committed, &tx.from);
        let cost = tx
            .total_cost()
            .ok_or_else(|| LedgerError::BalanceOverflow(tx.from.clone()))?;

        if sender.balance < cost {
            return Err(LedgerError::InsufficientBalance { has: sender.balance, needs: cost });
        }
        if tx.nonce != sender.nonce {
            return Err(LedgerError::InvalidNonce { expected: sender.nonce, got: tx.nonce });
        }

        let sender_change = StateChange {
            address: tx.from.clone(),
            previous_balance: sender.balance,
            new_balance: sender.balance - cost,
            previous_nonce: sender.nonce,
            new_nonce: sender.nonce + 1,
            block_height,
            tx_hash: Some(tx.hash.clone()),
        };

        // Read the recipient as if the debit had landed (covers from == to)
        let mut recipient = if tx.to == tx.from {
            let mut same = sender.clone();
            same.balance = sender_change.new_balance;
            same.nonce = sender_change.new_nonce;
            same
        } else {
            working.account(&committed, &tx.to)
        };
        let credited = recipient
            .balance
            .checked_add(tx.value)
            .ok_or_else(|| LedgerError::BalanceOverflow(tx.to.clone()))?;

        let recipient_change = StateChange {
            address: tx.to.clone(),
            previous_balance: recipient.balance,
            new_balance: credited,
            previous_nonce: recipient.nonce,
            new_nonce: recipient.nonce,
            block_height,
            tx_hash: Some(tx.hash.clone()),
        };

        sender.balance = sender_change.new_balance;
        sender.nonce = sender_change.new_nonce;
        recipient.balance = credited;

        if tx.to == tx.from {
            working.accounts.insert(recipient.address.clone(), recipient);
        } else {
            working.accounts.insert(sender.address.clone(), sender);
            working.accounts.insert(recipient.address.clone(), recipient);
        }
        working.changes.push(sender_change);
        working.changes.push(recipient_change);

        debug!(
            tx = %short(&tx.hash),
            from = %short(&tx.from),
            to = %short(&tx.to),
            value = %tx.value,
            height = block_height,
            "Transaction applied"
        );
        Ok(())
    }

    /// Credit a block reward (or genesis allocation) to `address`
    pub fn apply_reward(&self, address: &str, block_height: u64, amount: u128) -> Result<(), LedgerError> {
        let mut working = self.working.lock();
        let committed = self.committed.read();

        let mut account = working.account(&committed, address);
        let credited = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::BalanceOverflow(address.to_string()))?;

        working.changes.push(StateChange {
            address: address.to_string(),
            previous_balance: account.balance,
            new_balance: credited,
            previous_nonce: account.nonce,
            new_nonce: account.nonce,
            block_height,
            tx_hash: None,
        });
        account.balance = credited;
        working.accounts.insert(address.to_string(), account);
        Ok(())
    }

    /// Root over the writer's current view (committed overlaid with working)
    pub fn calculate_state_root(&self) -> String {
        let working = self.working.lock();
        let committed = self.committed.read();
        merged_root(&committed, &working)
    }

    /// Publish the working set and return the new state root
    pub fn commit(&self, block_height: u64) -> String {
        self.commit_with_summary(block_height).state_root
    }

    /// Publish the working set, returning the root and everything that changed
    pub fn commit_with_summary(&self, block_height: u64) -> CommitSummary {
        let mut working = self.working.lock();
        let mut committed = self.committed.write();

        let touched = std::mem::take(&mut working.accounts);
        let changes = std::mem::take(&mut working.changes);

        let accounts: Vec<Account> = touched.values().cloned().collect();
        committed.accounts.extend(touched);
        committed.state_root = root_of(committed.accounts.values());
        committed.height = Some(block_height);
        committed.history.extend(changes.iter().cloned());

        info!(
            height = block_height,
            state_root = %short(&committed.state_root),
            accounts = committed.accounts.len(),
            changes = changes.len(),
            "Ledger committed"
        );

        CommitSummary {
            block_height,
            state_root: committed.state_root.clone(),
            changes,
            accounts,
        }
    }

    /// Drop every uncommitted mutation
    pub fn discard(&self) {
        let mut working = self.working.lock();
        if !working.is_empty() {
            debug!(accounts = working.accounts.len(), "Discarding uncommitted ledger changes");
        }
        *working = WorkingSet::default();
    }

    /// Copy of committed state for a later [`restore`](Self::restore)
    pub fn snapshot(&self) -> LedgerSnapshot {
        let _working = self.working.lock();
        let committed = self.committed.read();
        LedgerSnapshot {
            accounts: committed.accounts.clone(),
            state_root: committed.state_root.clone(),
            height: committed.height,
            history_len: committed.history.len(),
        }
    }

    /// Roll committed state back to `snapshot`, dropping uncommitted work
    pub fn restore(&self, snapshot: LedgerSnapshot) {
        let mut working = self.working.lock();
        let mut committed = self.committed.write();

        *working = WorkingSet::default();
        committed.accounts = snapshot.accounts;
        committed.state_root = snapshot.state_root;
        committed.height = snapshot.height;
        committed.history.truncate(snapshot.history_len);

        warn!(
            height = ?committed.height,
            state_root = %short(&committed.state_root),
            "Ledger restored from snapshot"
        );
    }

    // ========================================================================
    // REBUILD
    // ========================================================================

    /// Wipe all state and re-apply the genesis allocation at height 0
    pub fn reset_to(&self, genesis: &GenesisConfig) -> Result<String, LedgerError> {
        {
            let mut working = self.working.lock();
            let mut committed = self.committed.write();
            *working = WorkingSet::default();
            committed.accounts.clear();
            committed.history.clear();
            committed.height = None;
            committed.state_root = root_of(std::iter::empty());
        }

        for allocation in &genesis.allocations {
            if let Err(e) = self.apply_reward(&allocation.address, 0, allocation.amount) {
                self.discard();
                return Err(e);
            }
        }
        Ok(self.commit(0))
    }

    /// Committed state as it stood after `height`, recovered by undoing
    /// every later state change in reverse. Accounts first touched after
    /// `height` disappear again.
    fn rewound(committed: &CommittedState, height: u64) -> Result<CommittedState, LedgerError> {
        if committed.height.map_or(true, |h| height > h) {
            return Err(LedgerError::HeightUnavailable { height, committed: committed.height });
        }
        let split = committed.history.partition_point(|c| c.block_height <= height);
        let (kept, undone) = committed.history.split_at(split);

        let mut accounts = committed.accounts.clone();
        for change in undone.iter().rev() {
            if let Some(account) = accounts.get_mut(&change.address) {
                account.balance = change.previous_balance;
                account.nonce = change.previous_nonce;
            }
        }
        let existed: HashSet<&str> = kept.iter().map(|c| c.address.as_str()).collect();
        accounts.retain(|address, _| existed.contains(address.as_str()));

        Ok(CommittedState {
            state_root: root_of(accounts.values()),
            accounts,
            height: Some(height),
            history: kept.to_vec(),
        })
    }

    /// Detached ledger holding the committed state after `height`
    pub fn state_at(&self, height: u64) -> Result<LedgerState, LedgerError> {
        let rewound = Self::rewound(&self.committed.read(), height)?;
        Ok(Self {
            committed: RwLock::new(rewound),
            working: Mutex::new(WorkingSet::default()),
        })
    }

    /// Take over `other`'s committed state, dropping uncommitted work here
    pub fn install(&self, other: LedgerState) {
        let mut working = self.working.lock();
        let mut committed = self.committed.write();
        *working = WorkingSet::default();
        *committed = other.committed.into_inner();
        info!(
            height = ?committed.height,
            state_root = %short(&committed.state_root),
            "Ledger state installed"
        );
    }

    /// Re-apply a block's transactions and reward, then check its state root.
    ///
    /// Any failing transaction or a root mismatch discards the working set
    /// and leaves committed state untouched.
    pub fn replay_block(&self, block: &Block, reward: u128) -> Result<CommitSummary, LedgerError> {
        let height = block.height();

        for tx in &block.transactions {
            if let Err(e) = self.apply_transaction(tx, height) {
                self.discard();
                return Err(LedgerError::ReplayFailed {
                    tx_hash: tx.hash.clone(),
                    reason: e.to_string(),
                });
            }
        }
        if let Err(e) = self.apply_reward(&block.header.producer, height, reward) {
            self.discard();
            return Err(e);
        }

        let actual = self.calculate_state_root();
        if actual != block.header.state_root {
            self.discard();
            return Err(LedgerError::StateRootMismatch {
                height,
                expected: block.header.state_root.clone(),
                actual,
            });
        }
        Ok(self.commit_with_summary(height))
    }
}

fn root_of<'a>(accounts: impl Iterator<Item = &'a Account>) -> String {
    let leaves: Vec<[u8; 32]> = accounts.map(Account::leaf_hash).collect();
    merkle_root_or(&leaves, EMPTY_STATE_LABEL)
}

fn merged_root(committed: &CommittedState, working: &WorkingSet) -> String {
    if working.accounts.is_empty() {
        return root_of(committed.accounts.values());
    }
    let mut merged = committed.accounts.clone();
    merged.extend(working.accounts.iter().map(|(k, v)| (k.clone(), v.clone())));
    root_of(merged.values())
}
