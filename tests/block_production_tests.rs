//! Block production and import tests
//!
//! - Producing blocks from admitted transfers
//! - Quorum failure rolls the ledger back and returns transactions
//! - Importing blocks from another node, in and out of order
//! - Reorganization between two nodes sharing a genesis


use std::sync::Arc;
use std::time::Duration;

use ledger_core::consensus::{ForkChoiceOutcome, GateRejection, StaticJudge};
use ledger_core::events::LedgerEvent;
use ledger_core::ledger::LedgerError;
use ledger_core::pool::EntryStatus;
use ledger_core::protocol::Block;
use ledger_core::runtime::{ProducerError, Validator};
use ledger_core::{Node, NodeError};
use tokio::sync::broadcast;
use test_helpers::*;

fn drain(rx: &mut broadcast::Receiver<LedgerEvent>) -> Vec<LedgerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn kinds(events: &[LedgerEvent]) -> Vec<&'static str> {
    events.iter().map(LedgerEvent::kind).collect()
}

fn main_blocks(node: &Node) -> Vec<Block> {
    (1..=node.height()).filter_map(|h| node.get_block_by_height(h)).collect()
}

// ============================================================================
// PRODUCTION
// ============================================================================

#[tokio::test]
async fn test_produced_block_applies_transfers() {
    let node = approving_node(funded_genesis());
    let mut events = node.subscribe();

    let from_alice = transfer(&alice(), carol().address(), 100, 0);
    let from_bob = transfer(&bob(), carol().address(), 200, 0);
    assert!(node.submit_transaction(from_alice.clone()).valid);
    assert!(node.submit_transaction(from_bob.clone()).valid);

    let produced = node.produce_block().await.unwrap();
    let block = &produced.block;
    assert_eq!(block.height(), 1);
    assert_eq!(block.transactions.len(), 2);
    assert_eq!(block.header.gas_used, 42_000);
    assert_eq!(produced.excluded, 0);
    assert!(produced.quorum.reached());

    assert_eq!(node.get_balance(alice().address()), 978_900);
    assert_eq!(node.get_balance(bob().address()), 1_000_000 - 200 - 21_000);
    assert_eq!(node.get_balance(carol().address()), 300);
    assert_eq!(node.get_balance(&block.header.producer), 10);
    assert_eq!(node.state_root(), block.header.state_root);
    assert!(node.pool().is_empty());

    let receipt = node.get_receipt(&from_alice.hash).unwrap().unwrap();
    assert_eq!(receipt.block_hash, block.hash());
    assert_eq!(node.get_receipts_for_block(1).len(), 2);

    assert_eq!(
        kinds(&drain(&mut events)),
        vec!["transaction_admitted", "transaction_admitted", "block_produced"]
    );

    node.flush().await;
    let stored = node.get_transaction(&from_bob.hash).unwrap().unwrap();
    assert_eq!(stored.block_height, 1);
    assert_eq!(node.durability_gaps(), 0);
}

#[tokio::test]
async fn test_empty_block_still_pays_reward() {
    let node = approving_node(funded_genesis());
    let first = node.produce_block().await.unwrap();
    let second = node.produce_block().await.unwrap();

    assert!(first.block.transactions.is_empty());
    assert_eq!(second.block.parent_hash(), first.block.hash());
    assert!(second.block.timestamp() > first.block.timestamp());
    assert_eq!(node.height(), 2);
    assert_eq!(node.get_balance(&first.block.header.producer), 20);
    assert_eq!(node.producer().stats().produced, 2);
}

#[tokio::test]
async fn test_nonce_gap_defers_until_filled() {
    let node = approving_node(funded_genesis());
    let alice = alice();

    let second = transfer(&alice, bob().address(), 1, 1);
    assert!(node.submit_transaction(second.clone()).valid);

    let produced = node.produce_block().await.unwrap();
    assert!(produced.block.transactions.is_empty());
    assert_eq!(produced.excluded, 1);
    assert_eq!(node.pool().get(&second.hash).map(|(_, s)| s), Some(EntryStatus::Pending));

    let first = transfer(&alice, bob().address(), 1, 0);
    assert!(node.submit_transaction(first.clone()).valid);
    let produced = node.produce_block().await.unwrap();
    let included: Vec<&str> = produced.block.transactions.iter().map(|t| t.hash.as_str()).collect();
    assert_eq!(included, vec![first.hash.as_str(), second.hash.as_str()]);
    assert_eq!(node.get_nonce(alice.address()), 2);
}

#[tokio::test]
async fn test_failed_quorum_rolls_back() {
    let approving: Arc<StaticJudge> = Arc::new(StaticJudge::approving());
    let skeptic = Arc::new(StaticJudge::rejecting("not convinced"));
    let validators = vec![
        Validator::new("producer-1", "producer", approving.clone()),
        Validator::new("skeptic-1", "skeptic one", skeptic.clone()),
        Validator::new("skeptic-2", "skeptic two", skeptic),
    ];
    let node = Node::with_validators(test_config(), funded_genesis(), approving, validators).unwrap();
    let mut events = node.subscribe();
    let root_before = node.state_root();

    let tx = transfer(&alice(), bob().address(), 500, 0);
    assert!(node.submit_transaction(tx.clone()).valid);

    let err = node.produce_block().await.unwrap_err();
    assert!(matches!(err, ProducerError::QuorumNotReached { approvals: 0, required: 2 }));

    assert_eq!(node.height(), 0);
    assert_eq!(node.state_root(), root_before);
    assert_eq!(node.get_balance(alice().address()), 1_000_000);
    assert_eq!(node.get_balance("producer-1"), 0);
    assert!(!node.ledger().has_uncommitted());
    assert_eq!(node.pool().get(&tx.hash).map(|(_, s)| s), Some(EntryStatus::Pending));

    let failure = drain(&mut events).into_iter().find_map(|event| match event {
        LedgerEvent::ConsensusFailed { height, returned_transactions, .. } => Some((height, returned_transactions)),
        _ => None,
    });
    assert_eq!(failure, Some((1, 1)));
    assert_eq!(node.producer().stats().failed, 1);

    // With the skeptics benched the producer has no one to convince
    let validators = node.producer().validators();
    assert!(validators.set_active("skeptic-1", false));
    assert!(validators.set_active("skeptic-2", false));
    let produced = node.produce_block().await.unwrap();
    assert_eq!(produced.block.header.producer, "producer-1");
    assert_eq!(produced.block.transactions.len(), 1);
    assert_eq!(validators.blocks_produced("producer-1"), 1);
}

#[tokio::test]
async fn test_spawned_producer_keeps_producing() {
    let node = approving_node(funded_genesis());
    let task = node.spawn_producer();
    tokio::time::sleep(Duration::from_millis(300)).await;
    task.abort();
    assert!(node.height() >= 2, "height {} after 300ms at 50ms interval", node.height());
}

// ============================================================================
// IMPORT
// ============================================================================

#[tokio::test]
async fn test_import_replays_blocks_in_and_out_of_order() {
    let source = approving_node(funded_genesis());
    assert!(source.submit_transaction(transfer(&alice(), carol().address(), 1_000, 0)).valid);
    source.produce_block().await.unwrap();
    assert!(source.submit_transaction(transfer(&bob(), carol().address(), 2_000, 0)).valid);
    source.produce_block().await.unwrap();
    let blocks = main_blocks(&source);

    let follower = approving_node(funded_genesis());
    let outcome = follower.import_block(blocks[1].clone()).await.unwrap();
    assert!(matches!(outcome, ForkChoiceOutcome::Orphaned { .. }));
    assert_eq!(follower.height(), 0);

    let outcome = follower.import_block(blocks[0].clone()).await.unwrap();
    assert!(matches!(outcome, ForkChoiceOutcome::ExtendedMain { height: 1 }));
    assert_eq!(follower.height(), 2);
    assert_eq!(follower.state_root(), source.state_root());
    assert_eq!(follower.get_balance(carol().address()), 3_000);
    assert_eq!(follower.get_receipts_for_block(2).len(), 1);

    let again = follower.import_block(blocks[0].clone()).await.unwrap();
    assert!(matches!(again, ForkChoiceOutcome::Duplicate));
}

#[tokio::test]
async fn test_forged_orphan_dropped_when_parent_arrives() {
    let source = approving_node(funded_genesis());
    assert!(source.submit_transaction(transfer(&alice(), carol().address(), 1_000, 0)).valid);
    source.produce_block().await.unwrap();
    assert!(source.submit_transaction(transfer(&bob(), carol().address(), 2_000, 0)).valid);
    source.produce_block().await.unwrap();
    let blocks = main_blocks(&source);

    let mut forged = blocks[1].clone();
    forged.header.state_root = "forged".into();
    forged.header.seal();

    let follower = approving_node(funded_genesis());
    let outcome = follower.import_block(forged.clone()).await.unwrap();
    assert!(matches!(outcome, ForkChoiceOutcome::Orphaned { .. }));

    // The parent imports cleanly; the forged child fails replay and is dropped
    let outcome = follower.import_block(blocks[0].clone()).await.unwrap();
    assert!(matches!(outcome, ForkChoiceOutcome::ExtendedMain { height: 1 }));
    assert_eq!(follower.height(), 1);
    assert_eq!(follower.get_latest_block().hash(), blocks[0].hash());
    assert!(follower.get_block_by_hash(forged.hash()).is_none());
    assert_eq!(follower.chain_stats().orphans, 0);
    assert_eq!(follower.ledger().committed_height(), Some(1));
    assert_eq!(follower.get_balance(carol().address()), 1_000);

    // The genuine block still extends the chain
    let outcome = follower.import_block(blocks[1].clone()).await.unwrap();
    assert!(matches!(outcome, ForkChoiceOutcome::ExtendedMain { height: 2 }));
    assert_eq!(follower.state_root(), source.state_root());
}

#[tokio::test]
async fn test_imported_transactions_rejected_on_resubmission() {
    let source = approving_node(funded_genesis());
    let tx = transfer(&alice(), carol().address(), 1_000, 0);
    assert!(source.submit_transaction(tx.clone()).valid);
    source.produce_block().await.unwrap();

    let follower = approving_node(funded_genesis());
    follower.import_block(main_blocks(&source)[0].clone()).await.unwrap();

    let result = follower.submit_transaction(tx);
    assert!(!result.valid);
    assert!(result.error.unwrap().contains("replay"));
}

#[tokio::test]
async fn test_import_rejects_inconsistent_blocks() {
    let source = approving_node(funded_genesis());
    assert!(source.submit_transaction(transfer(&alice(), bob().address(), 1, 0)).valid);
    let block = source.produce_block().await.unwrap().block;
    let follower = approving_node(funded_genesis());
    let root_before = follower.state_root();

    let mut forged_state = block.clone();
    forged_state.header.state_root = "forged".into();
    forged_state.header.seal();
    let err = follower.import_block(forged_state).await.unwrap_err();
    assert!(matches!(err, NodeError::Ledger(LedgerError::StateRootMismatch { height: 1, .. })));

    let mut forged_receipts = block.clone();
    forged_receipts.header.receipts_root = "forged".into();
    forged_receipts.header.seal();
    let err = follower.import_block(forged_receipts).await.unwrap_err();
    assert!(matches!(err, NodeError::ReceiptsRootMismatch { .. }));

    let mut tampered = block.clone();
    tampered.header.gas_used += 1;
    let err = follower.import_block(tampered).await.unwrap_err();
    assert!(matches!(err, NodeError::Gate(GateRejection::GasMismatch { .. })));

    assert_eq!(follower.height(), 0);
    assert_eq!(follower.state_root(), root_before);

    follower.import_block(block).await.unwrap();
    assert_eq!(follower.state_root(), source.state_root());
}

#[tokio::test]
async fn test_longer_remote_chain_reorganizes_local_ledger() {
    let local = approving_node(funded_genesis());
    let remote = approving_node(funded_genesis());
    assert_eq!(local.get_latest_block(), remote.get_latest_block(), "same genesis block");

    // Local: alice pays carol in block 1, five blocks total
    let local_tx = transfer(&alice(), carol().address(), 100, 0);
    assert!(local.submit_transaction(local_tx.clone()).valid);
    for _ in 0..5 {
        local.produce_block().await.unwrap();
    }
    let local_blocks = main_blocks(&local);

    // Remote: bob pays carol in block 1, six blocks total
    let remote_tx = transfer(&bob(), carol().address(), 200, 0);
    assert!(remote.submit_transaction(remote_tx.clone()).valid);
    for _ in 0..6 {
        remote.produce_block().await.unwrap();
    }
    let remote_blocks = main_blocks(&remote);

    let mut events = local.subscribe();
    let mut outcomes = Vec::new();
    for block in &remote_blocks {
        outcomes.push(local.import_block(block.clone()).await.unwrap());
    }
    for outcome in &outcomes[..5] {
        assert!(matches!(outcome, ForkChoiceOutcome::SideChain { refused: None, .. }));
    }
    let reorg = outcomes[5].reorganization().expect("sixth remote block wins");
    assert_eq!(reorg.depth, 5);
    assert_eq!(reorg.common_ancestor_height, 0);

    // Ledger follows the remote chain
    assert_eq!(local.height(), 6);
    assert_eq!(local.get_latest_block().hash(), remote_blocks[5].hash());
    assert_eq!(local.state_root(), remote.state_root());
    assert_eq!(local.get_balance(alice().address()), 1_000_000);
    assert_eq!(local.get_balance(carol().address()), 200);

    // Displaced transfer is pending again; its old receipt is gone
    assert_eq!(local.pool().get(&local_tx.hash).map(|(_, s)| s), Some(EntryStatus::Pending));
    local.flush().await;
    assert!(local.get_receipt(&local_tx.hash).unwrap().is_none());
    assert!(local.get_transaction(&local_tx.hash).unwrap().is_none());
    assert!(local.get_receipt(&remote_tx.hash).unwrap().is_some());

    let discarded = drain(&mut events).into_iter().find_map(|event| match event {
        LedgerEvent::ChainReorganized { discarded, .. } => Some(discarded),
        _ => None,
    });
    let expected: Vec<String> = local_blocks.iter().map(|b| b.hash().to_string()).collect();
    assert_eq!(discarded, Some(expected));

    // The reinstated transfer lands on top of the new chain
    let produced = local.produce_block().await.unwrap();
    assert_eq!(produced.block.height(), 7);
    assert_eq!(produced.block.transactions[0].hash, local_tx.hash);
    assert_eq!(local.get_balance(carol().address()), 300);
}

#[tokio::test]
async fn test_reorg_recomputes_difficulty_along_new_chain() {
    let mut config = test_config();
    config.chain.min_difficulty = 4;
    config.chain.difficulty_adjustment_interval = 2;
    let node = |config: &ledger_core::NodeConfig| {
        Node::new(config.clone(), funded_genesis(), Arc::new(StaticJudge::approving())).unwrap()
    };
    let local = node(&config);
    let remote = node(&config);

    local.produce_block().await.unwrap();
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        remote.produce_block().await.unwrap();
    }
    // Fast blocks: the adjustment at height 2 raises 4 to 5
    assert_eq!(remote.gate().current_difficulty(), 5);
    assert_eq!(local.gate().current_difficulty(), 4);

    let remote_blocks = main_blocks(&remote);
    local.import_block(remote_blocks[0].clone()).await.unwrap();
    let outcome = local.import_block(remote_blocks[1].clone()).await.unwrap();
    assert!(outcome.reorganization().is_some());
    assert_eq!(local.gate().current_difficulty(), 5);

    // The next remote block carries the raised difficulty and is accepted
    let outcome = local.import_block(remote_blocks[2].clone()).await.unwrap();
    assert!(matches!(outcome, ForkChoiceOutcome::ExtendedMain { height: 3 }));
    assert_eq!(local.gate().current_difficulty(), remote.gate().current_difficulty());
}
