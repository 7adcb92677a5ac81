//! Difficulty adjustment.
//!
//! Every `difficulty_adjustment_interval` blocks the average inter-block
//! time over the last interval is compared with the target. The ratio is
//! clamped to ±factor per adjustment and the result to [min, max].

use tracing::info;

use crate::config::ChainConfig;
use crate::protocol::Block;

#[derive(Debug, Clone)]
pub struct DifficultyManager {
    current: u64,
    target_block_time_ms: u64,
    interval: u64,
    factor: f64,
    min: u64,
    max: u64,
}

impl DifficultyManager {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            current: config.min_difficulty,
            target_block_time_ms: config.target_block_time_ms,
            interval: config.difficulty_adjustment_interval,
            factor: config.difficulty_adjustment_factor,
            min: config.min_difficulty,
            max: config.max_difficulty,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn set_difficulty(&mut self, difficulty: u64) {
        self.current = difficulty.clamp(self.min, self.max);
    }

    /// Adjustment happens on heights that are a multiple of the interval
    pub fn should_adjust(&self, height: u64) -> bool {
        height > 0 && height % self.interval == 0
    }

    /// Block meets the current requirement
    pub fn meets_target(&self, block: &Block) -> bool {
        block.header.difficulty >= self.current
    }

    /// Start over from the minimum and replay every adjustment point along
    /// `main` (genesis first). Used when the main chain is replaced.
    pub fn recompute(&mut self, main: &[Block]) -> u64 {
        self.current = self.min;
        for (index, block) in main.iter().enumerate() {
            if self.should_adjust(block.height()) {
                self.adjust(&main[..=index]);
            }
        }
        self.current
    }

    /// Recalculate from the tail of `recent` (main chain, oldest first).
    ///
    /// Returns the current difficulty unchanged when fewer than `interval`
    /// blocks are available.
    pub fn adjust(&mut self, recent: &[Block]) -> u64 {
        let interval = self.interval as usize;
        if interval < 2 || recent.len() < interval {
            return self.current;
        }

        let window = &recent[recent.len() - interval..];
        let total: u64 = window
            .windows(2)
            .map(|pair| pair[1].timestamp().saturating_sub(pair[0].timestamp()))
            .sum();
        let average = total as f64 / (window.len() - 1) as f64;

        let ratio = if average > 0.0 {
            self.target_block_time_ms as f64 / average
        } else {
            f64::INFINITY
        };
        let clamped = ratio.clamp(1.0 - self.factor, 1.0 + self.factor);

        let next = (self.current as f64 * clamped).round();
        let next = (next.max(0.0) as u64).clamp(self.min, self.max);

        if next != self.current {
            info!(
                from = self.current,
                to = next,
                avg_block_time_ms = average,
                "Difficulty adjusted"
            );
            self.current = next;
        }
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BlockHeader, GENESIS_PARENT_HASH};

    fn blocks_with_spacing(count: usize, spacing_ms: u64) -> Vec<Block> {
        (0..count)
            .map(|i| Block {
                header: BlockHeader {
                    height: i as u64,
                    parent_hash: GENESIS_PARENT_HASH.to_string(),
                    producer: "p".into(),
                    timestamp: 1_000_000 + i as u64 * spacing_ms,
                    nonce: 0,
                    difficulty: 1,
                    gas_used: 0,
                    gas_limit: 0,
                    state_root: String::new(),
                    transactions_root: String::new(),
                    receipts_root: String::new(),
                    hash: format!("h{}", i),
                },
                transactions: vec![],
            })
            .collect()
    }

    fn manager(start: u64) -> DifficultyManager {
        let mut m = DifficultyManager::new(&ChainConfig::default());
        m.set_difficulty(start);
        m
    }

    #[test]
    fn test_fast_blocks_raise_difficulty_by_at_most_25_percent() {
        let mut m = manager(1_000);
        // 1s blocks against a 10s target: ratio 10, clamped to 1.25
        assert_eq!(m.adjust(&blocks_with_spacing(10, 1_000)), 1_250);
    }

    #[test]
    fn test_slow_blocks_lower_difficulty() {
        let mut m = manager(1_000);
        // 40s blocks: ratio 0.25, clamped to 0.75
        assert_eq!(m.adjust(&blocks_with_spacing(10, 40_000)), 750);
    }

    #[test]
    fn test_on_target_is_stable_and_short_history_ignored() {
        let mut m = manager(1_000);
        assert_eq!(m.adjust(&blocks_with_spacing(10, 10_000)), 1_000);
        assert_eq!(m.adjust(&blocks_with_spacing(3, 1)), 1_000);
    }

    #[test]
    fn test_bounds_clamp() {
        let mut m = manager(1);
        assert_eq!(m.adjust(&blocks_with_spacing(10, 1_000_000)), 1);

        let mut m = manager(MAX_FOR_TEST);
        assert_eq!(m.adjust(&blocks_with_spacing(10, 1)), MAX_FOR_TEST);
    }

    const MAX_FOR_TEST: u64 = crate::config::MAX_DIFFICULTY;

    #[test]
    fn test_recompute_matches_incremental_adjustment() {
        let config = ChainConfig { min_difficulty: 4, ..ChainConfig::default() };
        let chain = blocks_with_spacing(31, 1_000);
        let mut incremental = DifficultyManager::new(&config);
        for index in 0..chain.len() {
            if incremental.should_adjust(chain[index].height()) {
                incremental.adjust(&chain[..=index]);
            }
        }
        // 4 -> 5 -> 6 -> 8 at heights 10, 20, 30
        assert_eq!(incremental.current(), 8);

        let mut replaced = DifficultyManager::new(&config);
        replaced.set_difficulty(777);
        assert_eq!(replaced.recompute(&chain), 8);

        // A slow replacement chain brings the requirement back down
        assert_eq!(replaced.recompute(&blocks_with_spacing(31, 60_000)), 4);
    }

    #[test]
    fn test_should_adjust_on_interval() {
        let m = manager(1);
        assert!(!m.should_adjust(0));
        assert!(!m.should_adjust(9));
        assert!(m.should_adjust(10));
        assert!(m.should_adjust(20));
    }
}
