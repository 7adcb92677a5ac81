//! Admission pool tests
//!
//! - Rule order and rejection messages
//! - Replay protection
//! - Nonce lookahead window
//! - Block assembly hooks (take / return / remove / reinstate)


use std::sync::Arc;

use ledger_core::config::PoolConfig;
use ledger_core::ledger::LedgerState;
use ledger_core::pool::{AdmissionPool, EntryStatus};
use test_helpers::*;

fn pool_for(ledger: &Arc<LedgerState>) -> AdmissionPool {
    AdmissionPool::new(Arc::clone(ledger), PoolConfig::default())
}

fn rejection(pool: &AdmissionPool, tx: ledger_core::Transaction) -> String {
    let result = pool.add_transaction(tx);
    assert!(!result.valid, "expected a rejection");
    result.error.unwrap_or_default()
}

// ============================================================================
// VALIDATION
// ============================================================================

#[test]
fn test_valid_transfer_is_admitted() {
    let ledger = ledger_with(&[(alice().address(), 1_000_000)]);
    let pool = pool_for(&ledger);

    let tx = transfer(&alice(), bob().address(), 100, 0);
    let result = pool.add_transaction(tx.clone());
    assert!(result.valid);
    assert_eq!(result.error, None);
    assert!(pool.contains(&tx.hash));
    assert_eq!(pool.get(&tx.hash).map(|(_, s)| s), Some(EntryStatus::Pending));
}

#[test]
fn test_duplicate_submission_is_a_replay() {
    let ledger = ledger_with(&[(alice().address(), 1_000_000)]);
    let pool = pool_for(&ledger);

    let tx = transfer(&alice(), bob().address(), 100, 0);
    assert!(pool.add_transaction(tx.clone()).valid);
    assert_eq!(rejection(&pool, tx), "Transaction already known (replay)");
    assert_eq!(pool.len(), 1);
}

#[test]
fn test_confirmed_hash_stays_known() {
    let ledger = ledger_with(&[(alice().address(), 1_000_000)]);
    let pool = pool_for(&ledger);

    let tx = transfer(&alice(), bob().address(), 100, 0);
    assert!(pool.add_transaction(tx.clone()).valid);
    assert_eq!(pool.remove_transactions(&[tx.hash.clone()]), 1);

    assert!(pool.is_known(&tx.hash));
    assert_eq!(rejection(&pool, tx), "Transaction already known (replay)");
}

#[test]
fn test_rules_apply_in_fixed_order() {
    let ledger = ledger_with(&[(alice().address(), 1_000_000)]);
    let pool = pool_for(&ledger);
    let alice = alice();

    // Self transfer is reported before the bad gas limit
    let to_self = transfer_with_gas(&alice, alice.address(), 1, 0, 1, 10);
    assert_eq!(rejection(&pool, to_self), "Cannot send to self");

    let low_limit = transfer_with_gas(&alice, bob().address(), 1, 0, 0, 10);
    assert_eq!(rejection(&pool, low_limit), "Gas limit too low: 10 < 21000");

    let high_limit = transfer_with_gas(&alice, bob().address(), 1, 0, 1, 30_000_001);
    assert_eq!(rejection(&pool, high_limit), "Gas limit too high: 30000001 > 30000000");

    let free = transfer_with_gas(&alice, bob().address(), 1, 0, 0, 21_000);
    assert_eq!(rejection(&pool, free), "Gas price too low: 0 < 1");

    let mut blank = transfer(&alice, bob().address(), 1, 0);
    blank.to.clear();
    assert_eq!(rejection(&pool, blank), "Missing required fields");
}

#[test]
fn test_hash_and_signature_checks() {
    let ledger = ledger_with(&[(alice().address(), 1_000_000)]);
    let pool = pool_for(&ledger);

    let mut wrong_hash = transfer(&alice(), bob().address(), 1, 0);
    wrong_hash.value = 2;
    assert_eq!(rejection(&pool, wrong_hash), "Invalid transaction hash");

    let mut unsigned = transfer(&alice(), bob().address(), 1, 0);
    unsigned.signature.clear();
    unsigned.hash = unsigned.compute_hash();
    assert_eq!(rejection(&pool, unsigned), "Missing signature");

    let mut forged = transfer(&alice(), bob().address(), 1, 0);
    forged.value = 500;
    forged.hash = forged.compute_hash();
    assert_eq!(rejection(&pool, forged), "Invalid signature");

    let mut foreign = transfer(&alice(), bob().address(), 1, 0);
    foreign.signature = carol().sign(&foreign.signing_message()).unwrap();
    foreign.hash = foreign.compute_hash();
    assert_eq!(rejection(&pool, foreign), "Invalid signature");
}

#[test]
fn test_balance_must_cover_value_and_gas() {
    let ledger = ledger_with(&[(alice().address(), 21_099)]);
    let pool = pool_for(&ledger);

    let tx = transfer(&alice(), bob().address(), 100, 0);
    assert_eq!(rejection(&pool, tx), "Insufficient balance: has 21099, needs 21100");

    let exact = transfer(&alice(), bob().address(), 99, 0);
    assert!(pool.add_transaction(exact).valid);
}

#[test]
fn test_nonce_window() {
    let (alice, bob) = (alice(), bob());
    let ledger = ledger_with(&[(alice.address(), 10_000_000)]);
    let pool = pool_for(&ledger);

    assert!(pool.add_transaction(transfer(&alice, bob.address(), 1, 10)).valid);
    assert_eq!(
        rejection(&pool, transfer(&alice, bob.address(), 1, 11)),
        "Nonce too high: expected at most 10, got 11"
    );

    ledger.apply_transaction(&transfer(&alice, bob.address(), 5, 0), 1).unwrap();
    ledger.commit(1);
    assert_eq!(
        rejection(&pool, transfer(&alice, bob.address(), 2, 0)),
        "Nonce too low: expected at least 1, got 0"
    );
    assert!(pool.add_transaction(transfer(&alice, bob.address(), 1, 11)).valid);
}

// ============================================================================
// ORDERING AND ASSEMBLY HOOKS
// ============================================================================

#[test]
fn test_pending_ordered_by_gas_price_then_nonce() {
    let (alice, bob) = (alice(), bob());
    let ledger = ledger_with(&[(alice.address(), 10_000_000)]);
    let pool = pool_for(&ledger);

    let cheap = transfer_with_gas(&alice, bob.address(), 1, 0, 1, 21_000);
    let pricey = transfer_with_gas(&alice, bob.address(), 1, 2, 5, 21_000);
    let pricey_low_nonce = transfer_with_gas(&alice, bob.address(), 1, 1, 5, 21_000);
    for tx in [&cheap, &pricey, &pricey_low_nonce] {
        assert!(pool.add_transaction(tx.clone()).valid);
    }

    let order: Vec<String> = pool.get_pending_transactions(10).into_iter().map(|t| t.hash).collect();
    assert_eq!(order, vec![pricey_low_nonce.hash, pricey.hash, cheap.hash]);
    assert_eq!(pool.get_pending_transactions(1).len(), 1);
}

#[test]
fn test_take_for_block_marks_in_flight() {
    let (alice, bob) = (alice(), bob());
    let ledger = ledger_with(&[(alice.address(), 10_000_000)]);
    let pool = pool_for(&ledger);
    for nonce in 0..3 {
        assert!(pool.add_transaction(transfer(&alice, bob.address(), 1, nonce)).valid);
    }

    let taken = pool.take_for_block(2);
    assert_eq!(taken.len(), 2);
    assert_eq!(pool.stats().in_flight, 2);
    assert_eq!(pool.stats().pending, 1);
    assert!(pool.take_for_block(10).len() == 1, "in-flight entries are not pulled twice");

    let hashes: Vec<String> = taken.iter().map(|t| t.hash.clone()).collect();
    assert_eq!(pool.return_to_pending(&hashes), 2);
    assert_eq!(pool.get_pending_transactions(10).len(), 2);
}

#[test]
fn test_reinstate_bypasses_replay_but_not_state_checks() {
    let (alice, bob) = (alice(), bob());
    let ledger = ledger_with(&[(alice.address(), 10_000_000)]);
    let pool = pool_for(&ledger);

    let first = transfer(&alice, bob.address(), 1, 0);
    let second = transfer(&alice, bob.address(), 1, 1);
    assert!(pool.add_transaction(first.clone()).valid);
    assert!(pool.add_transaction(second.clone()).valid);
    pool.remove_transactions(&[first.hash.clone(), second.hash.clone()]);

    // Nonce 0 is now spent on this chain; only nonce 1 can come back
    ledger.apply_transaction(&first, 1).unwrap();
    ledger.commit(1);

    assert_eq!(pool.reinstate(vec![first.clone(), second.clone()]), 1);
    assert!(!pool.contains(&first.hash));
    assert!(pool.contains(&second.hash));
    assert_eq!(pool.reinstate(vec![second]), 0, "already pending");
}

#[test]
fn test_pending_for_address_includes_recipient() {
    let ledger = ledger_with(&[(alice().address(), 10_000_000), (bob().address(), 10_000_000)]);
    let pool = pool_for(&ledger);

    assert!(pool.add_transaction(transfer(&alice(), bob().address(), 1, 0)).valid);
    assert!(pool.add_transaction(transfer(&bob(), carol().address(), 1, 0)).valid);

    assert_eq!(pool.pending_for_address(alice().address()).len(), 1);
    assert_eq!(pool.pending_for_address(bob().address()).len(), 2);
    assert_eq!(pool.pending_for_address(carol().address()).len(), 1);
}
