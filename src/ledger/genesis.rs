//! Genesis allocation.

use serde::{Deserialize, Serialize};

/// Total supply minted at genesis: 1,000,000 tokens at 18 decimals
pub const INITIAL_SUPPLY: u128 = 1_000_000 * 10u128.pow(18);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub address: String,
    pub amount: u128,
}

/// Initial balances and the genesis block timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub allocations: Vec<GenesisAllocation>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl GenesisConfig {
    pub fn new(timestamp: u64) -> Self {
        Self { allocations: Vec::new(), timestamp }
    }

    pub fn with_allocation(mut self, address: impl Into<String>, amount: u128) -> Self {
        self.allocations.push(GenesisAllocation { address: address.into(), amount });
        self
    }

    /// The network's standard split of [`INITIAL_SUPPLY`]:
    /// 10% genesis, 50% faucet, 40% treasury (treasury takes any rounding)
    pub fn standard(genesis: &str, faucet: &str, treasury: &str, timestamp: u64) -> Self {
        let genesis_share = INITIAL_SUPPLY / 10;
        let faucet_share = INITIAL_SUPPLY / 2;
        let treasury_share = INITIAL_SUPPLY - genesis_share - faucet_share;

        Self::new(timestamp)
            .with_allocation(genesis, genesis_share)
            .with_allocation(faucet, faucet_share)
            .with_allocation(treasury, treasury_share)
    }

    /// Sum of all allocations, `None` on overflow
    pub fn total_supply(&self) -> Option<u128> {
        self.allocations
            .iter()
            .try_fold(0u128, |acc, a| acc.checked_add(a.amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_split_sums_to_supply() {
        let config = GenesisConfig::standard("g", "f", "t", 0);
        assert_eq!(config.allocations.len(), 3);
        assert_eq!(config.total_supply(), Some(INITIAL_SUPPLY));
        assert_eq!(config.allocations[0].amount, INITIAL_SUPPLY / 10);
        assert_eq!(config.allocations[1].amount, INITIAL_SUPPLY / 2);
    }
}
