// ============================================================================
// RECEIPT / LOG INDEX
// ============================================================================
//
// One receipt per included transaction, created when its block commits.
// Receipts are committed to by the block's `receipts_root`, which covers
// only block-independent fields so the root can be computed before the
// block hash exists.
//
// ============================================================================

pub mod bloom;

use borsh::BorshSerialize;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{merkle_root_or, sha256};
use crate::ledger::LedgerError;
use crate::protocol::{canonical_bytes, Transaction};

pub use bloom::{bloom_add, bloom_contains, LogsBloom, BLOOM_BITS, BLOOM_BYTES};

/// Topic of the log every successful transfer emits
pub const TRANSFER_TOPIC: &str = "Transfer";

/// Label hashed for the root of a block without receipts
pub const EMPTY_RECEIPTS_LABEL: &str = "empty_receipts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionStatus {
    Failure = 0,
    Success = 1,
    OutOfGas = 2,
    InvalidSignature = 3,
    InsufficientBalance = 4,
    InvalidNonce = 5,
}

impl TransactionStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<&LedgerError> for TransactionStatus {
    fn from(err: &LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance { .. } => Self::InsufficientBalance,
            LedgerError::InvalidNonce { .. } => Self::InvalidNonce,
            _ => Self::Failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Emitting address
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    /// Position among all logs of the block
    pub log_index: u32,
    pub transaction_index: u32,
    pub transaction_hash: String,
    pub block_hash: String,
    pub block_number: u64,
}

impl LogEntry {
    /// `Transfer(from, to)` with the value as data
    pub fn transfer(tx: &Transaction, transaction_index: u32, log_index: u32, block_number: u64) -> Self {
        Self {
            address: tx.from.clone(),
            topics: vec![TRANSFER_TOPIC.to_string(), tx.from.clone(), tx.to.clone()],
            data: tx.value.to_string(),
            log_index,
            transaction_index,
            transaction_hash: tx.hash.clone(),
            block_hash: String::new(),
            block_number,
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.address == topic || self.topics.iter().any(|t| t == topic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub transaction_index: u32,
    pub block_hash: String,
    pub block_number: u64,
    pub from: String,
    pub to: String,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub status: TransactionStatus,
    pub logs: Vec<LogEntry>,
    pub logs_bloom: LogsBloom,
    /// Post-block state root, stamped once the block is sealed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_root: Option<String>,
}

/// Build a receipt; the bloom covers every log address and topic
#[allow(clippy::too_many_arguments)]
pub fn create_receipt(
    tx: &Transaction,
    index: u32,
    block_hash: &str,
    block_number: u64,
    gas_used: u64,
    cumulative_gas_used: u64,
    status: TransactionStatus,
    logs: Vec<LogEntry>,
) -> TransactionReceipt {
    let mut logs_bloom = LogsBloom::new();
    for log in &logs {
        logs_bloom.add(&log.address);
        for topic in &log.topics {
            logs_bloom.add(topic);
        }
    }

    TransactionReceipt {
        transaction_hash: tx.hash.clone(),
        transaction_index: index,
        block_hash: block_hash.to_string(),
        block_number,
        from: tx.from.clone(),
        to: tx.to.clone(),
        gas_used,
        cumulative_gas_used,
        status,
        logs,
        logs_bloom,
        state_root: None,
    }
}

/// Stamp receipts and their logs with the sealed block hash
pub fn assign_block_hash(receipts: &mut [TransactionReceipt], block_hash: &str) {
    for receipt in receipts {
        receipt.block_hash = block_hash.to_string();
        for log in &mut receipt.logs {
            log.block_hash = block_hash.to_string();
        }
    }
}

/// Stamp receipts with everything only known after sealing: the block
/// hash and the post-block state root
pub fn stamp_sealed_block(receipts: &mut [TransactionReceipt], block_hash: &str, state_root: &str) {
    assign_block_hash(receipts, block_hash);
    for receipt in receipts.iter_mut() {
        receipt.state_root = Some(state_root.to_string());
    }
}

#[derive(BorshSerialize)]
struct ReceiptLeaf {
    transaction_hash: String,
    status: u8,
    gas_used: u64,
    cumulative_gas_used: u64,
    logs_bloom: String,
    /// (address, topics, data) of each log
    logs: Vec<(String, Vec<String>, String)>,
}

fn receipt_leaf(receipt: &TransactionReceipt) -> [u8; 32] {
    let leaf = ReceiptLeaf {
        transaction_hash: receipt.transaction_hash.clone(),
        status: receipt.status.code(),
        gas_used: receipt.gas_used,
        cumulative_gas_used: receipt.cumulative_gas_used,
        logs_bloom: receipt.logs_bloom.to_hex(),
        logs: receipt
            .logs
            .iter()
            .map(|l| (l.address.clone(), l.topics.clone(), l.data.clone()))
            .collect(),
    };
    sha256(&canonical_bytes(&leaf))
}

/// Success receipts for every transaction of a block, each with one
/// Transfer log. Gas used per transaction is its gas limit. The block hash
/// is left empty for [`assign_block_hash`].
pub fn build_block_receipts(transactions: &[Transaction], block_number: u64) -> Vec<TransactionReceipt> {
    let mut cumulative = 0u64;
    transactions
        .iter()
        .enumerate()
        .map(|(index, tx)| {
            let index = index as u32;
            cumulative = cumulative.saturating_add(tx.gas_limit);
            let logs = vec![LogEntry::transfer(tx, index, index, block_number)];
            create_receipt(
                tx,
                index,
                "",
                block_number,
                tx.gas_limit,
                cumulative,
                TransactionStatus::Success,
                logs,
            )
        })
        .collect()
}

/// Merkle root over the block-independent fields of each receipt
pub fn calculate_receipts_root(receipts: &[TransactionReceipt]) -> String {
    let leaves: Vec<[u8; 32]> = receipts.iter().map(receipt_leaf).collect();
    merkle_root_or(&leaves, EMPTY_RECEIPTS_LABEL)
}

/// Union of the receipts' blooms, the block-level filter
pub fn accrued_bloom(receipts: &[TransactionReceipt]) -> LogsBloom {
    receipts.iter().fold(LogsBloom::new(), |mut bloom, receipt| {
        bloom.accrue(&receipt.logs_bloom);
        bloom
    })
}

// ============================================================================
// INDEX
// ============================================================================

/// Receipts keyed by transaction hash, with a per-block listing
#[derive(Debug, Default)]
pub struct ReceiptIndex {
    by_tx: DashMap<String, TransactionReceipt>,
    by_block: DashMap<u64, Vec<String>>,
}

impl ReceiptIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_receipt(&self, receipt: TransactionReceipt) {
        let hash = receipt.transaction_hash.clone();
        let block_number = receipt.block_number;

        if let Some(previous) = self.by_tx.insert(hash.clone(), receipt) {
            if previous.block_number != block_number {
                if let Some(mut listed) = self.by_block.get_mut(&previous.block_number) {
                    listed.retain(|h| *h != hash);
                }
            }
        }
        let mut listed = self.by_block.entry(block_number).or_default();
        if !listed.contains(&hash) {
            listed.push(hash);
        }
    }

    pub fn store_block(&self, receipts: impl IntoIterator<Item = TransactionReceipt>) {
        for receipt in receipts {
            self.store_receipt(receipt);
        }
    }

    pub fn get_receipt(&self, tx_hash: &str) -> Option<TransactionReceipt> {
        self.by_tx.get(tx_hash).map(|r| r.value().clone())
    }

    /// Receipts of one block in transaction order
    pub fn get_block_receipts(&self, block_number: u64) -> Vec<TransactionReceipt> {
        let hashes = self
            .by_block
            .get(&block_number)
            .map(|h| h.value().clone())
            .unwrap_or_default();
        let mut receipts: Vec<TransactionReceipt> =
            hashes.iter().filter_map(|h| self.get_receipt(h)).collect();
        receipts.sort_by_key(|r| r.transaction_index);
        receipts
    }

    /// Drop every receipt of a block, returning them
    pub fn remove_block(&self, block_number: u64) -> Vec<TransactionReceipt> {
        let Some((_, hashes)) = self.by_block.remove(&block_number) else {
            return Vec::new();
        };
        let removed: Vec<TransactionReceipt> = hashes
            .iter()
            .filter_map(|h| self.by_tx.remove(h).map(|(_, r)| r))
            .collect();
        debug!(block_number, removed = removed.len(), "Dropped block receipts");
        removed
    }

    /// Union of every receipt bloom in a block
    pub fn block_bloom(&self, block_number: u64) -> LogsBloom {
        accrued_bloom(&self.get_block_receipts(block_number))
    }

    /// Logs in a block that mention `topic`. The block bloom and then each
    /// receipt bloom act as prefilters.
    pub fn logs_matching(&self, block_number: u64, topic: &str) -> Vec<LogEntry> {
        let receipts = self.get_block_receipts(block_number);
        if !accrued_bloom(&receipts).contains(topic) {
            return Vec::new();
        }
        receipts
            .into_iter()
            .filter(|r| r.logs_bloom.contains(topic))
            .flat_map(|r| r.logs.into_iter())
            .filter(|log| log.matches(topic))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tx.is_empty()
    }
}
