//! Validity gate tests
//!
//! - Block contents against header claims (gas, roots, size)
//! - Heuristic judge verdicts flowing through the acceptance rule
//! - Difficulty adjustment feeding the structural check


use std::sync::Arc;

use ledger_core::config::{ChainConfig, ProducerConfig};
use ledger_core::consensus::{GateContext, GateRejection, HeuristicJudge, StaticJudge, ValidityGate};
use ledger_core::protocol::{Block, Transaction};
use test_helpers::*;

fn approving_gate(chain: &ChainConfig) -> ValidityGate {
    ValidityGate::new(Arc::new(StaticJudge::approving()), chain, &ProducerConfig::default())
}

/// Child of `parent` carrying `transactions` with a consistent header
fn block_with(parent: &Block, transactions: Vec<Transaction>) -> Block {
    let mut block = child_block(parent, "producer", 1_000, "txs");
    block.header.gas_used = Block::gas_for(&transactions);
    block.header.transactions_root = Block::transactions_root(&transactions);
    block.transactions = transactions;
    block.header.seal();
    block
}

fn with_parent(parent: &Block) -> GateContext<'_> {
    GateContext { parent: Some(parent), ..Default::default() }
}

// ============================================================================
// STRUCTURE
// ============================================================================

#[test]
fn test_consistent_block_passes_structure() {
    let gate = approving_gate(&ChainConfig::default());
    let genesis = genesis_block();
    let block = block_with(&genesis, vec![transfer(&alice(), bob().address(), 5, 0)]);
    assert_eq!(gate.check_structure(&block, with_parent(&genesis)), Ok(()));
}

#[test]
fn test_gas_claims_must_match_transactions() {
    let gate = approving_gate(&ChainConfig::default());
    let genesis = genesis_block();

    let mut understated = block_with(&genesis, vec![transfer(&alice(), bob().address(), 5, 0)]);
    understated.header.gas_used = 0;
    understated.header.seal();
    assert_eq!(
        gate.check_structure(&understated, with_parent(&genesis)),
        Err(GateRejection::GasMismatch { claimed: 0, actual: 21_000 })
    );

    let mut over_limit = block_with(&genesis, vec![transfer(&alice(), bob().address(), 5, 0)]);
    over_limit.header.gas_limit = 20_000;
    over_limit.header.seal();
    assert_eq!(
        gate.check_structure(&over_limit, with_parent(&genesis)),
        Err(GateRejection::GasExceedsLimit { used: 21_000, limit: 20_000 })
    );
}

#[test]
fn test_swapped_transactions_break_the_root() {
    let gate = approving_gate(&ChainConfig::default());
    let genesis = genesis_block();
    let first = transfer(&alice(), bob().address(), 5, 0);
    let second = transfer(&alice(), bob().address(), 6, 1);

    let mut block = block_with(&genesis, vec![first.clone(), second.clone()]);
    block.transactions = vec![second, first];
    assert_eq!(
        gate.check_structure(&block, with_parent(&genesis)),
        Err(GateRejection::TransactionsRootMismatch)
    );
}

#[test]
fn test_block_size_and_producer_limits() {
    let producer = ProducerConfig { max_txs_per_block: 1, ..ProducerConfig::default() };
    let gate = ValidityGate::new(Arc::new(StaticJudge::approving()), &ChainConfig::default(), &producer);
    let genesis = genesis_block();

    let crowded = block_with(
        &genesis,
        vec![transfer(&alice(), bob().address(), 5, 0), transfer(&alice(), bob().address(), 6, 1)],
    );
    assert_eq!(
        gate.check_structure(&crowded, with_parent(&genesis)),
        Err(GateRejection::TooManyTransactions { got: 2, max: 1 })
    );

    let mut anonymous = child_block(&genesis, "", 1_000, "anon");
    anonymous.header.seal();
    assert_eq!(
        gate.check_structure(&anonymous, with_parent(&genesis)),
        Err(GateRejection::MissingProducer)
    );
}

#[test]
fn test_orphan_context_skips_linkage() {
    let gate = approving_gate(&ChainConfig::default());
    let genesis = genesis_block();
    let far = build_branch(&genesis, 3, "producer", "far");

    // Without a parent only self-contained checks run
    assert_eq!(gate.check_structure(&far[2], GateContext::default()), Ok(()));
    assert!(matches!(
        gate.check_structure(&far[2], with_parent(&genesis)),
        Err(GateRejection::HeightMismatch { expected: 1, got: 3 })
    ));
}

// ============================================================================
// JUDGMENT
// ============================================================================

#[tokio::test]
async fn test_heuristic_judge_accepts_round_trip_block_with_warning() {
    let gate = ValidityGate::new(
        Arc::new(HeuristicJudge::new()),
        &ChainConfig::default(),
        &ProducerConfig::default(),
    );
    let genesis = genesis_block();

    let clean = block_with(&genesis, vec![transfer(&alice(), bob().address(), 5, 0)]);
    let judgment = gate.validate(&clean, with_parent(&genesis)).await.unwrap();
    assert!(judgment.valid);
    assert!(judgment.concerns.is_empty());
    assert!(judgment.warnings.is_empty());

    let round_trip = block_with(
        &genesis,
        vec![transfer(&alice(), bob().address(), 5, 0), transfer(&bob(), alice().address(), 5, 0)],
    );
    let judgment = gate.validate(&round_trip, with_parent(&genesis)).await.unwrap();
    assert!(judgment.valid);
    assert!(!judgment.flags.potential_attack);
    assert!(judgment.warnings.iter().any(|w| w.contains("wash trading")));

    let stats = gate.stats();
    assert_eq!((stats.accepted, stats.rejected), (2, 0));
    assert_eq!(stats.judge, "heuristic");
}

#[tokio::test]
async fn test_structural_failure_skips_the_judge() {
    let gate = approving_gate(&ChainConfig::default());
    let genesis = genesis_block();
    let mut block = child_block(&genesis, "producer", 1_000, "x");
    block.header.timestamp = genesis.timestamp();
    block.header.seal();

    let result = gate.validate(&block, with_parent(&genesis)).await;
    assert!(matches!(result, Err(GateRejection::TimestampNotIncreasing { .. })));
    assert_eq!(gate.cached_judgments(), 0);
}

// ============================================================================
// DIFFICULTY
// ============================================================================

/// `count` blocks at the given spacing and difficulty on top of `parent`
fn timed_branch(parent: &Block, count: usize, spacing_ms: u64, difficulty: u64) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(count);
    for _ in 0..count {
        let tip = blocks.last().unwrap_or(parent);
        let mut block = child_block(tip, "producer", spacing_ms, "timed");
        block.header.difficulty = difficulty;
        block.header.seal();
        blocks.push(block);
    }
    blocks
}

#[test]
fn test_fast_blocks_raise_required_difficulty() {
    let chain = ChainConfig { min_difficulty: 4, ..ChainConfig::default() };
    let gate = approving_gate(&chain);
    let genesis = genesis_block();
    assert_eq!(gate.current_difficulty(), 4);

    // Ten blocks one second apart against a ten second target
    let mut main = vec![genesis.clone()];
    main.extend(timed_branch(&genesis, 10, 1_000, 4));
    for index in 1..main.len() {
        assert_eq!(gate.check_structure(&main[index], with_parent(&main[index - 1])), Ok(()));
        gate.record_accepted(&main[index], &main[..=index]);
    }
    assert_eq!(gate.current_difficulty(), 5, "raised by at most 25%");

    let tip = main.last().unwrap();
    let easy = timed_branch(tip, 1, 1_000, 4);
    assert_eq!(
        gate.check_structure(&easy[0], with_parent(tip)),
        Err(GateRejection::DifficultyTooLow { got: 4, required: 5 })
    );
    let hard = timed_branch(tip, 1, 1_000, 5);
    assert_eq!(gate.check_structure(&hard[0], with_parent(tip)), Ok(()));
}

#[test]
fn test_slow_blocks_lower_required_difficulty() {
    let chain = ChainConfig { min_difficulty: 1, ..ChainConfig::default() };
    let gate = approving_gate(&chain);
    let genesis = genesis_block();

    let mut main = vec![genesis.clone()];
    main.extend(timed_branch(&genesis, 10, 60_000, 1));
    for index in 1..main.len() {
        gate.record_accepted(&main[index], &main[..=index]);
    }
    assert_eq!(gate.current_difficulty(), 1, "never below the minimum");
}
