// ============================================================================
// BLOCK PRODUCER
// ============================================================================
//
// One cycle per tick:
//
//   snapshot ledger ─▶ take txs from pool ─▶ apply ─▶ reward ─▶ commit
//        │                                                         │
//        │                       receipts ◀────────────────────────┘
//        │                          │
//        │                 header, seal ─▶ gate ─▶ quorum ─▶ fork choice
//        │                                   │        │          │
//        └──────────── restore ◀─────────────┴────────┴──────────┘
//                  (on any rejection)
//
// The ledger commit happens before the gate so the header can carry the
// real state root. A rejected block is undone by restoring the snapshot and
// returning every pulled transaction to pending.
//
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::validators::{QuorumResult, Validator, ValidatorSet};
use crate::config::{NodeConfig, ProducerConfig};
use crate::consensus::{ChainManager, ForkChoiceOutcome, GateContext, GateRejection, JudgeContext, ValidityGate};
use crate::events::{EventBus, LedgerEvent};
use crate::ledger::{CommitSummary, GenesisConfig, LedgerError, LedgerState};
use crate::pool::AdmissionPool;
use crate::protocol::{now_millis, short, Block, BlockHeader, Transaction, GENESIS_PARENT_HASH, GENESIS_PRODUCER};
use crate::receipts::{
    build_block_receipts, calculate_receipts_root, stamp_sealed_block, ReceiptIndex, TransactionReceipt,
    TransactionStatus,
};
use crate::storage::{PersistJob, Persister};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("A production cycle is already in flight")]
    CycleInFlight,

    #[error("No active validator available")]
    NoValidators,

    #[error("Block failed validity gate: {0}")]
    Gate(#[from] GateRejection),

    #[error("Consensus not reached: {approvals}/{required} approvals")]
    QuorumNotReached { approvals: usize, required: usize },

    #[error("Chain rejected block: {0}")]
    ChainRejected(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Shared components a producer and an importer both write through
#[derive(Clone)]
pub struct ChainHandles {
    pub ledger: Arc<LedgerState>,
    pub pool: Arc<AdmissionPool>,
    pub gate: Arc<ValidityGate>,
    pub chain: Arc<RwLock<ChainManager>>,
    pub receipts: Arc<ReceiptIndex>,
    pub events: EventBus,
    pub persister: Option<Persister>,
    /// Held for the whole of a production cycle or a block import
    pub writer: Arc<tokio::sync::Mutex<()>>,
}

impl ChainHandles {
    /// Main chain tail of at most `count` blocks, oldest first
    pub fn recent_blocks(&self, count: usize) -> Vec<Block> {
        self.chain.read().recent_blocks(count).to_vec()
    }

    pub fn persist(&self, job: PersistJob) {
        if let Some(persister) = &self.persister {
            persister.submit(job);
        }
    }
}

/// A block that made it onto the main chain
#[derive(Debug, Clone, Serialize)]
pub struct ProducedBlock {
    pub block: Block,
    pub receipts: Vec<TransactionReceipt>,
    pub quorum: QuorumResult,
    /// Pulled transactions that did not make it into the block
    pub excluded: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProducerStats {
    pub produced: u64,
    pub failed: u64,
    pub last_height: u64,
}

/// Output of the ledger half of a cycle
struct Assembly {
    block: Block,
    receipts: Vec<TransactionReceipt>,
    summary: CommitSummary,
    /// Failed or deferred, back to pending on success
    retry: Vec<String>,
    /// Nonce already used, dropped from the pool
    stale: Vec<String>,
}

/// Resets the in-flight flag when the cycle ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct BlockProducer {
    handles: ChainHandles,
    validators: Arc<ValidatorSet>,
    config: ProducerConfig,
    /// Blocks handed to the judge and to difficulty adjustment
    recent_window: usize,
    in_flight: AtomicBool,
    produced: AtomicU64,
    failed: AtomicU64,
}

impl BlockProducer {
    pub fn new(handles: ChainHandles, validators: Arc<ValidatorSet>, config: &NodeConfig) -> Self {
        Self {
            handles,
            validators,
            config: config.producer.clone(),
            recent_window: config.chain.difficulty_adjustment_interval as usize + 1,
            in_flight: AtomicBool::new(false),
            produced: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn validators(&self) -> &Arc<ValidatorSet> {
        &self.validators
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            produced: self.produced.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_height: self.handles.chain.read().height(),
        }
    }

    /// Run one production cycle
    pub async fn produce_block(&self) -> Result<ProducedBlock, ProducerError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Skipping production tick, previous cycle still running");
            return Err(ProducerError::CycleInFlight);
        }
        let _in_flight = InFlight(&self.in_flight);
        let _writer = self.handles.writer.lock().await;

        let producer = self.validators.next_producer().ok_or(ProducerError::NoValidators)?;
        let (parent, recent) = {
            let chain = self.handles.chain.read();
            (chain.latest_block().clone(), chain.recent_blocks(self.recent_window).to_vec())
        };
        let height = parent.height() + 1;

        let snapshot = self.handles.ledger.snapshot();
        let pulled = self.handles.pool.take_for_block(self.config.max_txs_per_block);
        let pulled_hashes: Vec<String> = pulled.iter().map(|tx| tx.hash.clone()).collect();
        debug!(height, producer = %producer.name, pulled = pulled.len(), "Producing block");

        match self.run_cycle(&producer, &parent, &recent, pulled).await {
            Ok((assembly, quorum)) => Ok(self.finish(&producer, assembly, quorum)),
            Err(e) => {
                self.handles.ledger.restore(snapshot);
                let returned = self.handles.pool.return_to_pending(&pulled_hashes);
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.handles.events.publish(LedgerEvent::ConsensusFailed {
                    height,
                    producer: producer.address.clone(),
                    reason: e.to_string(),
                    returned_transactions: returned,
                });
                warn!(height, producer = %producer.name, returned, error = %e, "Block production failed");
                Err(e)
            }
        }
    }

    async fn run_cycle(
        &self,
        producer: &Validator,
        parent: &Block,
        recent: &[Block],
        pulled: Vec<Transaction>,
    ) -> Result<(Assembly, QuorumResult), ProducerError> {
        let assembly = self.assemble(producer, parent, pulled)?;
        let block = &assembly.block;

        let ctx = GateContext {
            parent: Some(parent),
            recent,
            expected_state_root: Some(assembly.summary.state_root.as_str()),
        };
        self.handles.gate.validate(block, ctx).await?;

        let quorum = self
            .validators
            .collect_votes(block, JudgeContext { parent: Some(parent), recent }, &self.handles.gate)
            .await;
        if !quorum.reached() {
            return Err(ProducerError::QuorumNotReached {
                approvals: quorum.approvals,
                required: quorum.required,
            });
        }

        let outcome = self.handles.chain.write().insert_block(block.clone());
        match outcome {
            ForkChoiceOutcome::ExtendedMain { .. } => Ok((assembly, quorum)),
            other => {
                error!(height = block.height(), outcome = ?other.state(), "Produced block did not extend the main chain");
                Err(ProducerError::ChainRejected(format!("{:?}", other.state())))
            }
        }
    }

    /// Apply pulled transactions and the reward, commit, and build the sealed block
    fn assemble(&self, producer: &Validator, parent: &Block, pulled: Vec<Transaction>) -> Result<Assembly, ProducerError> {
        let ledger = &self.handles.ledger;
        let height = parent.height() + 1;

        let mut included: Vec<Transaction> = Vec::with_capacity(pulled.len());
        let mut retry = Vec::new();
        let mut stale = Vec::new();
        let mut gas_used = 0u64;

        for tx in pulled {
            let Some(next_gas) = gas_used
                .checked_add(tx.gas_limit)
                .filter(|gas| *gas <= self.config.block_gas_limit)
            else {
                debug!(tx = %short(&tx.hash), "Block gas limit reached, deferring transaction");
                retry.push(tx.hash);
                continue;
            };

            match ledger.apply_transaction(&tx, height) {
                Ok(()) => {
                    gas_used = next_gas;
                    included.push(tx);
                }
                Err(e) => {
                    let status = TransactionStatus::from(&e);
                    debug!(tx = %short(&tx.hash), status = ?status, error = %e, "Transaction excluded from block");
                    match e {
                        LedgerError::InvalidNonce { expected, got } if got < expected => stale.push(tx.hash),
                        _ => retry.push(tx.hash),
                    }
                }
            }
        }

        ledger.apply_reward(&producer.address, height, self.config.block_reward)?;
        let summary = ledger.commit_with_summary(height);

        let mut receipts = build_block_receipts(&included, height);

        let mut header = BlockHeader {
            height,
            parent_hash: parent.hash().to_string(),
            producer: producer.address.clone(),
            timestamp: now_millis().max(parent.timestamp() + 1),
            nonce: 0,
            difficulty: self.handles.gate.current_difficulty(),
            gas_used,
            gas_limit: self.config.block_gas_limit,
            state_root: summary.state_root.clone(),
            transactions_root: Block::transactions_root(&included),
            receipts_root: calculate_receipts_root(&receipts),
            hash: String::new(),
        };
        header.seal();
        stamp_sealed_block(&mut receipts, &header.hash, &header.state_root);

        Ok(Assembly {
            block: Block { header, transactions: included },
            receipts,
            summary,
            retry,
            stale,
        })
    }

    /// Bookkeeping once the block is on the main chain
    fn finish(&self, producer: &Validator, assembly: Assembly, quorum: QuorumResult) -> ProducedBlock {
        let Assembly { block, receipts, summary, retry, stale } = assembly;
        let handles = &self.handles;

        let recent = handles.recent_blocks(self.recent_window);
        handles.gate.record_accepted(&block, &recent);

        let included: Vec<String> = block.transactions.iter().map(|tx| tx.hash.clone()).collect();
        handles.pool.remove_transactions(&included);
        handles.pool.remove_transactions(&stale);
        handles.pool.return_to_pending(&retry);

        handles.receipts.store_block(receipts.iter().cloned());
        handles.persist(PersistJob::Block {
            block: block.clone(),
            accounts: summary.accounts,
            changes: summary.changes,
            receipts: receipts.clone(),
        });

        self.validators.record_block_produced(&producer.address);
        self.produced.fetch_add(1, Ordering::Relaxed);

        handles.events.publish(LedgerEvent::BlockProduced {
            height: block.height(),
            hash: block.hash().to_string(),
            producer: producer.address.clone(),
            transactions: block.transactions.len(),
            state_root: summary.state_root.clone(),
        });
        info!(
            height = block.height(),
            hash = %short(block.hash()),
            producer = %producer.name,
            txs = block.transactions.len(),
            gas_used = block.header.gas_used,
            approvals = quorum.approvals,
            state_root = %short(&summary.state_root),
            "Block produced"
        );

        ProducedBlock {
            block,
            receipts,
            quorum,
            excluded: retry.len() + stale.len(),
        }
    }
}

/// Rebuild `ledger` from `genesis` and return the height-0 block over it
pub fn build_genesis_block(ledger: &LedgerState, genesis: &GenesisConfig) -> Result<Block, LedgerError> {
    let state_root = ledger.reset_to(genesis)?;
    let mut header = BlockHeader {
        height: 0,
        parent_hash: GENESIS_PARENT_HASH.to_string(),
        producer: GENESIS_PRODUCER.to_string(),
        timestamp: genesis.timestamp,
        nonce: 0,
        difficulty: 0,
        gas_used: 0,
        gas_limit: 0,
        state_root,
        transactions_root: Block::transactions_root(&[]),
        receipts_root: calculate_receipts_root(&[]),
        hash: String::new(),
    };
    header.seal();
    info!(hash = %short(&header.hash), allocations = genesis.allocations.len(), "Genesis block built");
    Ok(Block { header, transactions: Vec::new() })
}

/// Produce a block every `interval` until the task is dropped
pub async fn run_block_producer(producer: Arc<BlockProducer>, interval: Duration) {
    info!(interval_ms = interval.as_millis() as u64, "Starting block production");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        // Errors are already logged and published by the cycle
        let _ = producer.produce_block().await;
    }
}
