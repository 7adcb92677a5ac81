//! Receipt and log index tests
//!
//! - Block receipts: cumulative gas, transfer logs, blooms
//! - Receipts root stability across block hash assignment
//! - Topic queries through the index


use ledger_core::receipts::{
    assign_block_hash, bloom_add, bloom_contains, build_block_receipts, calculate_receipts_root, LogsBloom,
    ReceiptIndex, TRANSFER_TOPIC,
};
use test_helpers::*;

fn sample_transactions() -> Vec<ledger_core::Transaction> {
    vec![
        transfer_with_gas(&alice(), bob().address(), 10, 0, 1, 21_000),
        transfer_with_gas(&alice(), carol().address(), 20, 1, 1, 50_000),
        transfer_with_gas(&bob(), carol().address(), 30, 0, 2, 25_000),
    ]
}

#[test]
fn test_block_receipts_accumulate_gas() {
    let receipts = build_block_receipts(&sample_transactions(), 7);

    let cumulative: Vec<u64> = receipts.iter().map(|r| r.cumulative_gas_used).collect();
    assert_eq!(cumulative, vec![21_000, 71_000, 96_000]);
    for (index, receipt) in receipts.iter().enumerate() {
        assert_eq!(receipt.transaction_index, index as u32);
        assert_eq!(receipt.block_number, 7);
        assert!(receipt.status.is_success());
        assert!(receipt.block_hash.is_empty());
        assert_eq!(receipt.logs.len(), 1);
        assert_eq!(receipt.logs[0].log_index, index as u32);
    }
}

#[test]
fn test_transfer_log_and_bloom_cover_both_parties() {
    let txs = sample_transactions();
    let receipts = build_block_receipts(&txs, 1);
    let first = &receipts[0];

    let log = &first.logs[0];
    assert_eq!(log.topics, vec![TRANSFER_TOPIC.to_string(), txs[0].from.clone(), txs[0].to.clone()]);
    assert_eq!(log.data, "10");

    assert!(first.logs_bloom.contains(TRANSFER_TOPIC));
    assert!(first.logs_bloom.contains(alice().address()));
    assert!(first.logs_bloom.contains(bob().address()));
}

#[test]
fn test_receipts_root_survives_block_hash_assignment() {
    let mut receipts = build_block_receipts(&sample_transactions(), 3);
    let root = calculate_receipts_root(&receipts);

    assign_block_hash(&mut receipts, "sealed-hash");
    assert!(receipts.iter().all(|r| r.block_hash == "sealed-hash"));
    assert!(receipts.iter().flat_map(|r| r.logs.iter()).all(|l| l.block_hash == "sealed-hash"));
    assert_eq!(calculate_receipts_root(&receipts), root);

    receipts.swap(0, 1);
    assert_ne!(calculate_receipts_root(&receipts), root, "order is committed to");
}

#[test]
fn test_logs_matching_filters_by_topic() {
    let index = ReceiptIndex::new();
    index.store_block(build_block_receipts(&sample_transactions(), 4));

    assert_eq!(index.len(), 3);
    assert_eq!(index.logs_matching(4, TRANSFER_TOPIC).len(), 3);
    assert_eq!(index.logs_matching(4, carol().address()).len(), 2);
    assert_eq!(index.logs_matching(4, bob().address()).len(), 2);
    assert!(index.logs_matching(4, "nobody").is_empty());
    assert!(index.logs_matching(5, TRANSFER_TOPIC).is_empty());
}

#[test]
fn test_block_accrued_bloom() {
    let receipts = build_block_receipts(&sample_transactions(), 1);
    let mut block_bloom = LogsBloom::new();
    for receipt in &receipts {
        block_bloom.accrue(&receipt.logs_bloom);
    }
    for party in [alice(), bob(), carol()] {
        assert!(block_bloom.contains(party.address()));
    }

    let hex = bloom_add(&LogsBloom::new().to_hex(), "topic").unwrap();
    assert!(bloom_contains(&hex, "topic"));
    assert!(!bloom_contains("not hex", "topic"));
}
