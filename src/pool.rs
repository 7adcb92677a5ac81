//! Admission Pool
//!
//! Holds signed transactions that have not been included in a block yet.
//! Every submission is checked against committed ledger state and the
//! replay set before it is accepted. Rejections come back as a
//! [`ValidationResult`] carrying a human-readable reason, never a panic.
//!
//! Entries live in a `DashMap`, so independent validations run in parallel.
//! The replay set is claimed atomically on insert: two racing submissions of
//! the same hash cannot both be admitted.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::ledger::LedgerState;
use crate::protocol::{now_millis, short, Transaction};

// ============================================================================
// VALIDATION RESULT
// ============================================================================

/// Why a transaction was refused admission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Missing required fields")]
    MissingFields,

    #[error("Cannot send to self")]
    SelfTransfer,

    #[error("Gas limit too low: {got} < {min}")]
    GasLimitTooLow { got: u64, min: u64 },

    #[error("Gas limit too high: {got} > {max}")]
    GasLimitTooHigh { got: u64, max: u64 },

    #[error("Gas price too low: {got} < {min}")]
    GasPriceTooLow { got: u128, min: u128 },

    #[error("Transaction already known (replay)")]
    Replay,

    #[error("Invalid transaction hash")]
    InvalidHash,

    #[error("Missing signature")]
    MissingSignature,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Amount overflows the 128-bit balance range")]
    AmountOverflow,

    #[error("Insufficient balance: has {has}, needs {needs}")]
    InsufficientBalance { has: u128, needs: u128 },

    #[error("Nonce too low: expected at least {expected}, got {got}")]
    NonceTooLow { expected: u64, got: u64 },

    #[error("Nonce too high: expected at most {max}, got {got}")]
    NonceTooHigh { max: u64, got: u64 },

    #[error("Transaction pool full ({0} pending)")]
    PoolFull(usize),
}

/// Outcome of a submission, as surfaced to API callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self { valid: true, error: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self { valid: false, error: Some(reason.into()) }
    }
}

impl From<Result<(), AdmissionError>> for ValidationResult {
    fn from(result: Result<(), AdmissionError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::rejected(e.to_string()),
        }
    }
}

// ============================================================================
// POOL ENTRIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Waiting for a block
    Pending,
    /// Pulled into a block that is being assembled
    InFlight,
}

#[derive(Debug, Clone)]
struct PoolEntry {
    tx: Transaction,
    status: EntryStatus,
    received_at: u64,
    /// Arrival order, used as the final tie-break
    seq: u64,
}

impl PoolEntry {
    fn priority(&self) -> (Reverse<u128>, u64, u64) {
        (Reverse(self.tx.gas_price), self.tx.nonce, self.seq)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pending: usize,
    pub in_flight: usize,
    pub known_hashes: usize,
}

// ============================================================================
// ADMISSION POOL
// ============================================================================

pub struct AdmissionPool {
    ledger: Arc<LedgerState>,
    config: PoolConfig,
    entries: DashMap<String, PoolEntry>,
    /// Every hash ever admitted (pending, in flight or confirmed)
    known: DashSet<String>,
    next_seq: AtomicU64,
}

impl AdmissionPool {
    pub fn new(ledger: Arc<LedgerState>, config: PoolConfig) -> Self {
        Self {
            ledger,
            config,
            entries: DashMap::new(),
            known: DashSet::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Validate and admit a transaction
    pub fn add_transaction(&self, tx: Transaction) -> ValidationResult {
        let hash = tx.hash.clone();
        let from = tx.from.clone();
        let result = self.admit(tx, true);
        match &result {
            Ok(()) => info!(tx = %short(&hash), from = %short(&from), "Transaction admitted"),
            Err(e) => warn!(tx = %short(&hash), reason = %e, "Transaction rejected"),
        }
        result.into()
    }

    fn admit(&self, tx: Transaction, check_replay: bool) -> Result<(), AdmissionError> {
        self.validate(&tx, check_replay)?;

        if self.entries.len() >= self.config.max_pending {
            return Err(AdmissionError::PoolFull(self.entries.len()));
        }
        // Atomic claim of the replay key
        if !self.known.insert(tx.hash.clone()) && check_replay {
            return Err(AdmissionError::Replay);
        }

        let entry = PoolEntry {
            status: EntryStatus::Pending,
            received_at: now_millis(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        self.entries.insert(entry.tx.hash.clone(), entry);
        Ok(())
    }

    /// Admission checks in their fixed order, stopping at the first failure
    fn validate(&self, tx: &Transaction, check_replay: bool) -> Result<(), AdmissionError> {
        if tx.hash.is_empty() || tx.from.is_empty() || tx.to.is_empty() {
            return Err(AdmissionError::MissingFields);
        }
        if tx.from == tx.to {
            return Err(AdmissionError::SelfTransfer);
        }
        // value is unsigned, so the non-negative check holds by construction
        if tx.gas_limit < self.config.min_gas_limit {
            return Err(AdmissionError::GasLimitTooLow {
                got: tx.gas_limit,
                min: self.config.min_gas_limit,
            });
        }
        if tx.gas_limit > self.config.max_gas_limit {
            return Err(AdmissionError::GasLimitTooHigh {
                got: tx.gas_limit,
                max: self.config.max_gas_limit,
            });
        }
        if tx.gas_price < self.config.min_gas_price {
            return Err(AdmissionError::GasPriceTooLow {
                got: tx.gas_price,
                min: self.config.min_gas_price,
            });
        }
        if check_replay && self.known.contains(&tx.hash) {
            return Err(AdmissionError::Replay);
        }
        if tx.compute_hash() != tx.hash {
            return Err(AdmissionError::InvalidHash);
        }
        if tx.signature.is_empty() {
            return Err(AdmissionError::MissingSignature);
        }
        if !tx.verify_signature() {
            return Err(AdmissionError::InvalidSignature);
        }

        let needs = tx.total_cost().ok_or(AdmissionError::AmountOverflow)?;
        if self.ledger.get_balance(&tx.to).checked_add(tx.value).is_none() {
            return Err(AdmissionError::AmountOverflow);
        }
        let balance = self.ledger.get_balance(&tx.from);
        if balance < needs {
            return Err(AdmissionError::InsufficientBalance { has: balance, needs });
        }

        let expected = self.ledger.get_nonce(&tx.from);
        if tx.nonce < expected {
            return Err(AdmissionError::NonceTooLow { expected, got: tx.nonce });
        }
        let max = expected.saturating_add(self.config.nonce_lookahead);
        if tx.nonce > max {
            return Err(AdmissionError::NonceTooHigh { max, got: tx.nonce });
        }
        Ok(())
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    fn sorted_pending(&self) -> Vec<PoolEntry> {
        let mut pending: Vec<PoolEntry> = self
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending)
            .map(|e| e.value().clone())
            .collect();
        pending.sort_by_key(PoolEntry::priority);
        pending
    }

    /// Pending transactions, highest gas price first
    pub fn get_pending_transactions(&self, limit: usize) -> Vec<Transaction> {
        self.sorted_pending()
            .into_iter()
            .take(limit)
            .map(|e| e.tx)
            .collect()
    }

    /// Pending or in-flight transactions sent from or to `address`
    pub fn pending_for_address(&self, address: &str) -> Vec<Transaction> {
        let mut matching: Vec<PoolEntry> = self
            .entries
            .iter()
            .filter(|e| e.tx.from == address || e.tx.to == address)
            .map(|e| e.value().clone())
            .collect();
        matching.sort_by_key(|e| e.seq);
        matching.into_iter().map(|e| e.tx).collect()
    }

    pub fn get(&self, hash: &str) -> Option<(Transaction, EntryStatus)> {
        self.entries.get(hash).map(|e| (e.tx.clone(), e.status))
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    /// True if the hash was ever admitted, including confirmed ones
    pub fn is_known(&self, hash: &str) -> bool {
        self.known.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        let in_flight = self
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::InFlight)
            .count();
        PoolStats {
            pending: self.entries.len() - in_flight,
            in_flight,
            known_hashes: self.known.len(),
        }
    }

    // ========================================================================
    // BLOCK ASSEMBLY HOOKS
    // ========================================================================

    /// Pull up to `limit` pending transactions and mark them in flight
    pub fn take_for_block(&self, limit: usize) -> Vec<Transaction> {
        let mut taken = Vec::with_capacity(limit);
        for candidate in self.sorted_pending() {
            if taken.len() >= limit {
                break;
            }
            if let Some(mut entry) = self.entries.get_mut(&candidate.tx.hash) {
                if entry.status == EntryStatus::Pending {
                    entry.status = EntryStatus::InFlight;
                    taken.push(entry.tx.clone());
                }
            }
        }
        debug!(count = taken.len(), "Transactions pulled for block");
        taken
    }

    /// Put in-flight transactions back up for the next block
    pub fn return_to_pending(&self, hashes: &[String]) -> usize {
        let mut returned = 0;
        for hash in hashes {
            if let Some(mut entry) = self.entries.get_mut(hash) {
                if entry.status == EntryStatus::InFlight {
                    entry.status = EntryStatus::Pending;
                    returned += 1;
                }
            }
        }
        if returned > 0 {
            info!(count = returned, "Transactions returned to pending");
        }
        returned
    }

    /// Drop confirmed transactions and record their hashes in the replay
    /// set, including ones this pool never saw (confirmed in imported blocks).
    pub fn remove_transactions(&self, hashes: &[String]) -> usize {
        let mut removed = 0;
        for hash in hashes {
            if self.entries.remove(hash.as_str()).is_some() {
                removed += 1;
            }
            self.known.insert(hash.clone());
        }
        debug!(count = removed, "Transactions confirmed and removed from pool");
        removed
    }

    /// Re-admit transactions from blocks that fell off the main chain.
    ///
    /// Skips the replay check (their hashes are already known) but runs
    /// every other rule against current state. Returns how many re-entered.
    pub fn reinstate(&self, transactions: Vec<Transaction>) -> usize {
        let mut reinstated = 0;
        for tx in transactions {
            if self.entries.contains_key(&tx.hash) {
                continue;
            }
            let hash = tx.hash.clone();
            match self.admit(tx, false) {
                Ok(()) => reinstated += 1,
                Err(e) => debug!(tx = %short(&hash), reason = %e, "Orphaned transaction not reinstated"),
            }
        }
        if reinstated > 0 {
            info!(count = reinstated, "Orphaned transactions reinstated");
        }
        reinstated
    }

    /// Discard pending entries older than the configured TTL.
    ///
    /// Expired hashes leave the replay set so they can be resubmitted.
    pub fn prune_expired(&self, now_ms: u64) -> usize {
        let ttl = self.config.entry_ttl_ms;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending && e.received_at.saturating_add(ttl) < now_ms)
            .map(|e| e.key().clone())
            .collect();

        for hash in &expired {
            self.entries.remove(hash);
            self.known.remove(hash);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired transactions pruned");
        }
        expired.len()
    }
}
