//! Block judges: the semantic half of the validity gate.
//!
//! A judge inspects a structurally sound block and returns a verdict with a
//! confidence and risk flags. The gate decides what the verdict means; the
//! judge only describes what it saw. Any implementation can be plugged in
//! behind [`BlockJudge`], including ones that call out to a remote service.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocol::{Block, Transaction};

/// Risk flags raised by a judge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgmentFlags {
    pub potential_attack: bool,
    pub suspicious_pattern: bool,
    pub unusual_gas_usage: bool,
    pub state_inconsistency: bool,
}

impl JudgmentFlags {
    pub fn any(&self) -> bool {
        self.potential_attack
            || self.suspicious_pattern
            || self.unusual_gas_usage
            || self.state_inconsistency
    }
}

/// A judge's verdict on one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub valid: bool,
    /// In [0, 1]
    pub confidence: f64,
    pub flags: JudgmentFlags,
    pub reasoning: String,
    /// Failed checks behind an invalid verdict
    #[serde(default)]
    pub concerns: Vec<String>,
    /// Observations that do not affect validity
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Judgment {
    pub fn approve(confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            valid: true,
            confidence: confidence.clamp(0.0, 1.0),
            flags: JudgmentFlags::default(),
            reasoning: reasoning.into(),
            concerns: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn reject(confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            valid: false,
            confidence: confidence.clamp(0.0, 1.0),
            flags: JudgmentFlags::default(),
            reasoning: reasoning.into(),
            concerns: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: JudgmentFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// What a judge may look at besides the block itself
#[derive(Debug, Clone, Copy)]
pub struct JudgeContext<'a> {
    pub parent: Option<&'a Block>,
    /// Recent main-chain blocks, oldest first
    pub recent: &'a [Block],
}

#[async_trait]
pub trait BlockJudge: Send + Sync {
    fn name(&self) -> &str;

    async fn judge(&self, block: &Block, ctx: JudgeContext<'_>) -> Judgment;
}

// ============================================================================
// HEURISTIC JUDGE
// ============================================================================

/// Addresses that both send and receive in a block, relative to its transaction count
const WASH_TRADING_RATIO: f64 = 0.3;
/// Share of transactions carrying the single most common value
const IDENTICAL_VALUE_RATIO: f64 = 0.5;
const IDENTICAL_VALUE_MIN_TXS: usize = 5;
const HIGH_GAS_PRICE_MULTIPLIER: u128 = 10;
/// Block gas usage above this share of its limit is unusual
const UNUSUAL_GAS_RATIO_PERCENT: u64 = 80;
const SUSPICIOUS_CONCERN_COUNT: usize = 2;

/// Local rule-based judge. Deterministic, never fails.
#[derive(Debug, Clone, Default)]
pub struct HeuristicJudge;

impl HeuristicJudge {
    pub fn new() -> Self {
        Self
    }

    /// Pattern checks over a block's transactions. The results are warnings only.
    pub fn analyze_transactions(transactions: &[Transaction]) -> Vec<String> {
        let mut concerns = Vec::new();
        if transactions.is_empty() {
            return concerns;
        }
        let count = transactions.len();

        let senders: HashSet<&str> = transactions.iter().map(|tx| tx.from.as_str()).collect();
        let receivers: HashSet<&str> = transactions.iter().map(|tx| tx.to.as_str()).collect();
        let overlap = senders.intersection(&receivers).count();
        if overlap as f64 > count as f64 * WASH_TRADING_RATIO {
            concerns.push(format!(
                "Possible wash trading: {} addresses both send and receive across {} transfers",
                overlap, count
            ));
        }

        let mut values: HashMap<u128, usize> = HashMap::new();
        for tx in transactions {
            *values.entry(tx.value).or_default() += 1;
        }
        let most_common = values.values().copied().max().unwrap_or(0);
        if count > IDENTICAL_VALUE_MIN_TXS && most_common as f64 > count as f64 * IDENTICAL_VALUE_RATIO {
            concerns.push(format!(
                "Suspicious pattern: {} of {} transfers carry an identical value",
                most_common, count
            ));
        }

        let total_price = transactions
            .iter()
            .fold(0u128, |acc, tx| acc.saturating_add(tx.gas_price));
        let average_price = total_price / count as u128;
        let expensive = transactions
            .iter()
            .filter(|tx| tx.gas_price > average_price.saturating_mul(HIGH_GAS_PRICE_MULTIPLIER))
            .count();
        if expensive > 0 {
            concerns.push(format!(
                "{} transfers pay more than {}x the average gas price",
                expensive, HIGH_GAS_PRICE_MULTIPLIER
            ));
        }

        concerns
    }
}

#[async_trait]
impl BlockJudge for HeuristicJudge {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn judge(&self, block: &Block, ctx: JudgeContext<'_>) -> Judgment {
        let header = &block.header;
        let mut concerns = Vec::new();

        if let Some(parent) = ctx.parent {
            if header.timestamp <= parent.timestamp() {
                concerns.push("Timestamp does not advance past parent".to_string());
            }
            if header.height != parent.height() + 1 {
                concerns.push(format!(
                    "Height {} does not follow parent height {}",
                    header.height,
                    parent.height()
                ));
            }
            if header.parent_hash != parent.hash() {
                concerns.push("Parent hash does not match parent block".to_string());
            }
        }
        if header.gas_used > header.gas_limit {
            concerns.push(format!(
                "Gas used {} exceeds gas limit {}",
                header.gas_used, header.gas_limit
            ));
        }
        if header.producer.is_empty() {
            concerns.push("No block producer specified".to_string());
        }
        let warnings = Self::analyze_transactions(&block.transactions);

        let valid = concerns.is_empty();
        let flags = JudgmentFlags {
            potential_attack: !valid,
            suspicious_pattern: warnings.len() > SUSPICIOUS_CONCERN_COUNT,
            unusual_gas_usage: header.gas_used.saturating_mul(100)
                > header.gas_limit.saturating_mul(UNUSUAL_GAS_RATIO_PERCENT),
            state_inconsistency: false,
        };
        let reasoning = if valid && warnings.is_empty() {
            format!("Block {} passed all heuristic checks", header.height)
        } else if valid {
            format!("Block {} passed with warnings: {}", header.height, warnings.join("; "))
        } else {
            format!("Block {} raised concerns: {}", header.height, concerns.join("; "))
        };

        Judgment {
            valid,
            confidence: if valid { 0.9 } else { 0.95 },
            flags,
            reasoning,
            concerns,
            warnings,
        }
    }
}

// ============================================================================
// STATIC JUDGE
// ============================================================================

/// Returns the same verdict for every block
#[derive(Debug, Clone)]
pub struct StaticJudge {
    judgment: Judgment,
}

impl StaticJudge {
    pub fn new(judgment: Judgment) -> Self {
        Self { judgment }
    }

    pub fn approving() -> Self {
        Self::new(Judgment::approve(1.0, "static approval"))
    }

    pub fn rejecting(reasoning: impl Into<String>) -> Self {
        Self::new(Judgment::reject(1.0, reasoning))
    }
}

#[async_trait]
impl BlockJudge for StaticJudge {
    fn name(&self) -> &str {
        "static"
    }

    async fn judge(&self, _block: &Block, _ctx: JudgeContext<'_>) -> Judgment {
        self.judgment.clone()
    }
}
