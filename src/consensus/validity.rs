//! Validity gate.
//!
//! Two stages. Stage 1 is deterministic structure: linkage to the parent,
//! size and gas bounds, the transactions root, the header hash, and the
//! state root the block claims. Stage 2 hands the block to the pluggable
//! [`BlockJudge`] and applies the acceptance rule to its verdict:
//!
//!   valid && confidence >= threshold && !potential_attack
//!
//! Verdicts are cached by block hash so a block is judged once. The cache
//! is cleared whenever the main chain reorganizes.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::difficulty::DifficultyManager;
use super::judge::{BlockJudge, JudgeContext, Judgment};
use crate::config::{ChainConfig, ProducerConfig};
use crate::protocol::{short, Block};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GateRejection {
    #[error("Invalid block height: expected {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("Invalid parent hash: expected {expected}, got {got}")]
    ParentMismatch { expected: String, got: String },

    #[error("Invalid timestamp: {got} is not after parent timestamp {parent}")]
    TimestampNotIncreasing { parent: u64, got: u64 },

    #[error("Block has no producer")]
    MissingProducer,

    #[error("Too many transactions: {got} > {max}")]
    TooManyTransactions { got: usize, max: usize },

    #[error("Block gas limit {got} exceeds maximum {max}")]
    GasLimitTooHigh { got: u64, max: u64 },

    #[error("Gas used {used} exceeds gas limit {limit}")]
    GasExceedsLimit { used: u64, limit: u64 },

    #[error("Gas used {claimed} does not match transactions ({actual})")]
    GasMismatch { claimed: u64, actual: u64 },

    #[error("Transactions root mismatch")]
    TransactionsRootMismatch,

    #[error("Block hash does not match header")]
    HashMismatch,

    #[error("Block has no state root")]
    MissingStateRoot,

    #[error("State root mismatch: block claims {claimed}, ledger computed {expected}")]
    StateRootMismatch { claimed: String, expected: String },

    #[error("Difficulty {got} below required {required}")]
    DifficultyTooLow { got: u64, required: u64 },

    #[error("Judge rejected block: {0}")]
    JudgeRejected(String),

    #[error("Judge confidence {confidence:.2} below threshold {threshold:.2}")]
    LowConfidence { confidence: f64, threshold: f64 },

    #[error("Potential attack detected: {0}")]
    PotentialAttack(String),
}

/// Everything the gate compares a block against
#[derive(Debug, Clone, Copy, Default)]
pub struct GateContext<'a> {
    /// `None` only for genesis
    pub parent: Option<&'a Block>,
    /// Recent main-chain blocks, oldest first
    pub recent: &'a [Block],
    /// Root the ledger computed for this block's contents, when known
    pub expected_state_root: Option<&'a str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GateStats {
    pub judge: String,
    pub cached_judgments: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub current_difficulty: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: u64,
    rejected: u64,
}

pub struct ValidityGate {
    judge: Arc<dyn BlockJudge>,
    confidence_threshold: f64,
    max_txs_per_block: usize,
    block_gas_limit: u64,
    difficulty: Mutex<DifficultyManager>,
    cache: DashMap<String, Judgment>,
    counters: Mutex<Counters>,
}

impl ValidityGate {
    pub fn new(judge: Arc<dyn BlockJudge>, chain: &ChainConfig, producer: &ProducerConfig) -> Self {
        Self {
            judge,
            confidence_threshold: chain.confidence_threshold,
            max_txs_per_block: producer.max_txs_per_block,
            block_gas_limit: producer.block_gas_limit,
            difficulty: Mutex::new(DifficultyManager::new(chain)),
            cache: DashMap::new(),
            counters: Mutex::new(Counters::default()),
        }
    }

    // ========================================================================
    // STAGE 1: STRUCTURE
    // ========================================================================

    pub fn check_structure(&self, block: &Block, ctx: GateContext<'_>) -> Result<(), GateRejection> {
        let header = &block.header;

        if let Some(parent) = ctx.parent {
            let expected = parent.height() + 1;
            if header.height != expected {
                return Err(GateRejection::HeightMismatch { expected, got: header.height });
            }
            if header.parent_hash != parent.hash() {
                return Err(GateRejection::ParentMismatch {
                    expected: parent.hash().to_string(),
                    got: header.parent_hash.clone(),
                });
            }
            if header.timestamp <= parent.timestamp() {
                return Err(GateRejection::TimestampNotIncreasing {
                    parent: parent.timestamp(),
                    got: header.timestamp,
                });
            }
        }

        if header.producer.is_empty() {
            return Err(GateRejection::MissingProducer);
        }
        if block.transactions.len() > self.max_txs_per_block {
            return Err(GateRejection::TooManyTransactions {
                got: block.transactions.len(),
                max: self.max_txs_per_block,
            });
        }
        if header.gas_limit > self.block_gas_limit {
            return Err(GateRejection::GasLimitTooHigh {
                got: header.gas_limit,
                max: self.block_gas_limit,
            });
        }
        if header.gas_used > header.gas_limit {
            return Err(GateRejection::GasExceedsLimit {
                used: header.gas_used,
                limit: header.gas_limit,
            });
        }
        let actual_gas = Block::gas_for(&block.transactions);
        if header.gas_used != actual_gas {
            return Err(GateRejection::GasMismatch { claimed: header.gas_used, actual: actual_gas });
        }
        if header.transactions_root != Block::transactions_root(&block.transactions) {
            return Err(GateRejection::TransactionsRootMismatch);
        }
        if !block.verify_hash() {
            return Err(GateRejection::HashMismatch);
        }
        if header.state_root.is_empty() {
            return Err(GateRejection::MissingStateRoot);
        }
        if let Some(expected) = ctx.expected_state_root {
            if header.state_root != expected {
                return Err(GateRejection::StateRootMismatch {
                    claimed: header.state_root.clone(),
                    expected: expected.to_string(),
                });
            }
        }
        if ctx.parent.is_some() {
            let difficulty = self.difficulty.lock();
            if !difficulty.meets_target(block) {
                return Err(GateRejection::DifficultyTooLow {
                    got: header.difficulty,
                    required: difficulty.current(),
                });
            }
        }
        Ok(())
    }

    // ========================================================================
    // STAGE 2: JUDGMENT
    // ========================================================================

    /// Judge `block`, reusing a cached verdict for the same hash
    pub async fn judge(&self, block: &Block, ctx: GateContext<'_>) -> Judgment {
        let cached = self.cache.get(block.hash()).map(|j| j.value().clone());
        if let Some(judgment) = cached {
            debug!(block = %short(block.hash()), "Using cached judgment");
            return judgment;
        }

        let judgment = self
            .judge
            .judge(block, JudgeContext { parent: ctx.parent, recent: ctx.recent })
            .await;
        self.cache.insert(block.hash().to_string(), judgment.clone());
        judgment
    }

    /// Acceptance rule applied to a verdict
    pub fn evaluate(&self, judgment: &Judgment) -> Result<(), GateRejection> {
        if !judgment.valid {
            return Err(GateRejection::JudgeRejected(judgment.reasoning.clone()));
        }
        if judgment.confidence < self.confidence_threshold {
            return Err(GateRejection::LowConfidence {
                confidence: judgment.confidence,
                threshold: self.confidence_threshold,
            });
        }
        if judgment.flags.potential_attack {
            return Err(GateRejection::PotentialAttack(judgment.reasoning.clone()));
        }
        Ok(())
    }

    /// Run both stages. Returns the verdict of an accepted block.
    pub async fn validate(&self, block: &Block, ctx: GateContext<'_>) -> Result<Judgment, GateRejection> {
        let result = match self.check_structure(block, ctx) {
            Ok(()) => {
                let judgment = self.judge(block, ctx).await;
                self.evaluate(&judgment).map(|()| judgment)
            }
            Err(e) => Err(e),
        };

        let mut counters = self.counters.lock();
        match &result {
            Ok(judgment) => {
                counters.accepted += 1;
                debug!(
                    block = %short(block.hash()),
                    height = block.height(),
                    confidence = judgment.confidence,
                    "Block passed validity gate"
                );
                if !judgment.warnings.is_empty() {
                    warn!(
                        block = %short(block.hash()),
                        warnings = %judgment.warnings.join("; "),
                        "Judge raised warnings"
                    );
                }
            }
            Err(reason) => {
                counters.rejected += 1;
                warn!(
                    block = %short(block.hash()),
                    height = block.height(),
                    reason = %reason,
                    "Block rejected by validity gate"
                );
            }
        }
        result
    }

    // ========================================================================
    // DIFFICULTY / CACHE
    // ========================================================================

    pub fn current_difficulty(&self) -> u64 {
        self.difficulty.lock().current()
    }

    /// Feed an accepted main-chain block to difficulty adjustment.
    /// `recent` is the main chain tail ending with `block`.
    pub fn record_accepted(&self, block: &Block, recent: &[Block]) -> u64 {
        let mut difficulty = self.difficulty.lock();
        if difficulty.should_adjust(block.height()) {
            difficulty.adjust(recent)
        } else {
            difficulty.current()
        }
    }

    /// Rebuild the difficulty requirement from a whole main chain
    pub fn recompute_difficulty(&self, main: &[Block]) -> u64 {
        let mut difficulty = self.difficulty.lock();
        let before = difficulty.current();
        let after = difficulty.recompute(main);
        if before != after {
            debug!(from = before, to = after, "Difficulty recomputed for new main chain");
        }
        after
    }

    pub fn invalidate_cache(&self) {
        let dropped = self.cache.len();
        self.cache.clear();
        if dropped > 0 {
            debug!(dropped, "Judgment cache cleared");
        }
    }

    pub fn cached_judgments(&self) -> usize {
        self.cache.len()
    }

    pub fn judge_name(&self) -> &str {
        self.judge.name()
    }

    pub fn stats(&self) -> GateStats {
        let counters = self.counters.lock();
        GateStats {
            judge: self.judge.name().to_string(),
            cached_judgments: self.cache.len(),
            accepted: counters.accepted,
            rejected: counters.rejected,
            current_difficulty: self.current_difficulty(),
        }
    }
}

impl std::fmt::Debug for ValidityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidityGate")
            .field("judge", &self.judge.name())
            .field("confidence_threshold", &self.confidence_threshold)
            .field("cached_judgments", &self.cache.len())
            .finish()
    }
}
