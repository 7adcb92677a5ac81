//! Node configuration.
//!
//! Every tunable has a default matching the reference network. Values can
//! be loaded from a JSON file (missing keys fall back to defaults) and then
//! overridden from `LEDGER_*` environment variables.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// DEFAULTS
// ============================================================================

pub const TARGET_BLOCK_TIME_MS: u64 = 10_000;
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 10;
pub const DIFFICULTY_ADJUSTMENT_FACTOR: f64 = 0.25;
pub const MIN_DIFFICULTY: u64 = 1;
pub const MAX_DIFFICULTY: u64 = 1_000_000;
pub const CONFIDENCE_THRESHOLD: f64 = 0.6;
pub const FORK_CHOICE_DEPTH: u64 = 6;
pub const MAX_REORG_DEPTH: u64 = 100;
pub const QUORUM_RATIO: f64 = 0.66;

pub const MIN_GAS_LIMIT: u64 = 21_000;
pub const MAX_GAS_LIMIT: u64 = 30_000_000;
pub const MIN_GAS_PRICE: u128 = 1;
pub const NONCE_LOOKAHEAD: u64 = 10;
pub const POOL_ENTRY_TTL_MS: u64 = 60 * 60 * 1000;
pub const MAX_PENDING: usize = 10_000;

pub const MAX_TXS_PER_BLOCK: usize = 100;
pub const BLOCK_GAS_LIMIT: u64 = 30_000_000;
/// 10 whole tokens at 18 decimals
pub const BLOCK_REWARD: u128 = 10 * 10u128.pow(18);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Consensus, difficulty and fork-choice parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub target_block_time_ms: u64,
    pub difficulty_adjustment_interval: u64,
    /// Maximum relative change per adjustment (0.25 = ±25%)
    pub difficulty_adjustment_factor: f64,
    pub min_difficulty: u64,
    pub max_difficulty: u64,
    /// Minimum judge confidence for a block to pass the validity gate
    pub confidence_threshold: f64,
    /// Depth after which a main-chain block is final
    pub fork_choice_depth: u64,
    pub max_reorg_depth: u64,
    /// Fraction of validators that must approve a block
    pub quorum_ratio: f64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            target_block_time_ms: TARGET_BLOCK_TIME_MS,
            difficulty_adjustment_interval: DIFFICULTY_ADJUSTMENT_INTERVAL,
            difficulty_adjustment_factor: DIFFICULTY_ADJUSTMENT_FACTOR,
            min_difficulty: MIN_DIFFICULTY,
            max_difficulty: MAX_DIFFICULTY,
            confidence_threshold: CONFIDENCE_THRESHOLD,
            fork_choice_depth: FORK_CHOICE_DEPTH,
            max_reorg_depth: MAX_REORG_DEPTH,
            quorum_ratio: QUORUM_RATIO,
        }
    }
}

/// Admission pool limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_gas_limit: u64,
    pub max_gas_limit: u64,
    pub min_gas_price: u128,
    /// How far past the account nonce a pending transaction may be
    pub nonce_lookahead: u64,
    pub entry_ttl_ms: u64,
    pub max_pending: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_gas_limit: MIN_GAS_LIMIT,
            max_gas_limit: MAX_GAS_LIMIT,
            min_gas_price: MIN_GAS_PRICE,
            nonce_lookahead: NONCE_LOOKAHEAD,
            entry_ttl_ms: POOL_ENTRY_TTL_MS,
            max_pending: MAX_PENDING,
        }
    }
}

/// Block assembly parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Cadence of the assembly loop
    pub block_interval_ms: u64,
    pub max_txs_per_block: usize,
    pub block_gas_limit: u64,
    pub block_reward: u128,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            block_interval_ms: TARGET_BLOCK_TIME_MS,
            max_txs_per_block: MAX_TXS_PER_BLOCK,
            block_gas_limit: BLOCK_GAS_LIMIT,
            block_reward: BLOCK_REWARD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the redb file. `None` keeps everything in memory.
    pub data_dir: Option<String>,
    /// Enable the in-memory read cache in front of the store
    pub fast_cache: bool,
}

// ============================================================================
// NODE CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain: ChainConfig,
    pub pool: PoolConfig,
    pub producer: ProducerConfig,
    pub storage: StorageConfig,
}

impl NodeConfig {
    /// Load from a JSON file; absent keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `LEDGER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override values present in the environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        override_from_env("LEDGER_TARGET_BLOCK_TIME_MS", &mut self.chain.target_block_time_ms)?;
        override_from_env("LEDGER_DIFFICULTY_INTERVAL", &mut self.chain.difficulty_adjustment_interval)?;
        override_from_env("LEDGER_CONFIDENCE_THRESHOLD", &mut self.chain.confidence_threshold)?;
        override_from_env("LEDGER_FORK_CHOICE_DEPTH", &mut self.chain.fork_choice_depth)?;
        override_from_env("LEDGER_MAX_REORG_DEPTH", &mut self.chain.max_reorg_depth)?;
        override_from_env("LEDGER_QUORUM_RATIO", &mut self.chain.quorum_ratio)?;
        override_from_env("LEDGER_MIN_GAS_PRICE", &mut self.pool.min_gas_price)?;
        override_from_env("LEDGER_NONCE_LOOKAHEAD", &mut self.pool.nonce_lookahead)?;
        override_from_env("LEDGER_MAX_PENDING", &mut self.pool.max_pending)?;
        override_from_env("LEDGER_BLOCK_INTERVAL_MS", &mut self.producer.block_interval_ms)?;
        override_from_env("LEDGER_MAX_TXS_PER_BLOCK", &mut self.producer.max_txs_per_block)?;
        override_from_env("LEDGER_BLOCK_REWARD", &mut self.producer.block_reward)?;
        if let Ok(dir) = std::env::var("LEDGER_DATA_DIR") {
            self.storage.data_dir = Some(dir).filter(|d| !d.is_empty());
        }
        Ok(())
    }

    /// Reject bounds that cannot work together
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chain = &self.chain;
        if chain.min_difficulty == 0 || chain.min_difficulty > chain.max_difficulty {
            return Err(ConfigError::Invalid(format!(
                "difficulty bounds [{}, {}]",
                chain.min_difficulty, chain.max_difficulty
            )));
        }
        if chain.difficulty_adjustment_interval < 2 {
            return Err(ConfigError::Invalid(
                "difficulty adjustment interval must be at least 2".into(),
            ));
        }
        if !(0.0..1.0).contains(&chain.difficulty_adjustment_factor) {
            return Err(ConfigError::Invalid("difficulty adjustment factor must be in [0, 1)".into()));
        }
        if !(0.0..=1.0).contains(&chain.confidence_threshold) {
            return Err(ConfigError::Invalid("confidence threshold must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&chain.quorum_ratio) {
            return Err(ConfigError::Invalid("quorum ratio must be in [0, 1]".into()));
        }
        if self.pool.min_gas_limit > self.pool.max_gas_limit {
            return Err(ConfigError::Invalid(format!(
                "gas limit bounds [{}, {}]",
                self.pool.min_gas_limit, self.pool.max_gas_limit
            )));
        }
        if self.producer.max_txs_per_block == 0 || self.producer.block_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "block interval and block size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn override_from_env<T: FromStr>(key: &str, target: &mut T) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(key) {
        *target = value.parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chain.fork_choice_depth, 6);
        assert_eq!(config.chain.max_reorg_depth, 100);
        assert_eq!(config.pool.min_gas_limit, 21_000);
        assert_eq!(config.producer.max_txs_per_block, 100);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"chain": {{"max_reorg_depth": 3}}, "producer": {{"block_interval_ms": 500}}}}"#).unwrap();

        let config = NodeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.chain.max_reorg_depth, 3);
        assert_eq!(config.chain.fork_choice_depth, FORK_CHOICE_DEPTH);
        assert_eq!(config.producer.block_interval_ms, 500);
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = NodeConfig::default();
        config.pool.min_gas_limit = 50;
        config.pool.max_gas_limit = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = NodeConfig::default();
        config.chain.min_difficulty = 0;
        assert!(config.validate().is_err());
    }
}
