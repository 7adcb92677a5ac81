//! Asynchronous best-effort persistence.
//!
//! Jobs are queued on an unbounded channel and written by a background
//! task. A failed write is logged and counted as a durability gap; it
//! never blocks or fails block production.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{LedgerStore, StoreError};
use crate::protocol::{short, Account, Block, StateChange};
use crate::receipts::TransactionReceipt;

#[derive(Debug)]
pub enum PersistJob {
    /// Everything a committed block produced
    Block {
        block: Block,
        accounts: Vec<Account>,
        changes: Vec<StateChange>,
        receipts: Vec<TransactionReceipt>,
    },
    /// Account records without a block (genesis, ledger rebuilds)
    Accounts(Vec<Account>),
    /// Acknowledged once every earlier job has been written
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    persisted_blocks: AtomicU64,
    durability_gaps: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct Persister {
    sender: mpsc::UnboundedSender<PersistJob>,
    counters: Arc<Counters>,
}

impl Persister {
    /// Start the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(store: Arc<dyn LedgerStore>) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<PersistJob>();
        let counters = Arc::new(Counters::default());
        let task_counters = Arc::clone(&counters);

        let handle = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                match job {
                    PersistJob::Flush(ack) => {
                        let _ = ack.send(());
                    }
                    PersistJob::Block { block, accounts, changes, receipts } => {
                        match write_block(store.as_ref(), &block, &accounts, &changes, &receipts) {
                            Ok(()) => {
                                task_counters.persisted_blocks.fetch_add(1, Ordering::Relaxed);
                                debug!(height = block.height(), hash = %short(block.hash()), "Block persisted");
                            }
                            Err(e) => {
                                task_counters.durability_gaps.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    height = block.height(),
                                    hash = %short(block.hash()),
                                    error = %e,
                                    "Failed to persist block, continuing without durability"
                                );
                            }
                        }
                    }
                    PersistJob::Accounts(accounts) => {
                        if let Err(e) = store.upsert_accounts(&accounts) {
                            task_counters.durability_gaps.fetch_add(1, Ordering::Relaxed);
                            warn!(accounts = accounts.len(), error = %e, "Failed to persist accounts");
                        }
                    }
                }
            }
            debug!("Persister stopped");
        });

        (Self { sender, counters }, handle)
    }

    /// Queue a job. A closed channel counts as a durability gap.
    pub fn submit(&self, job: PersistJob) -> bool {
        match self.sender.send(job) {
            Ok(()) => true,
            Err(_) => {
                self.counters.durability_gaps.fetch_add(1, Ordering::Relaxed);
                warn!("Persister is not running, record dropped");
                false
            }
        }
    }

    /// Wait until every job queued before this call has been handled
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(PersistJob::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub fn persisted_blocks(&self) -> u64 {
        self.counters.persisted_blocks.load(Ordering::Relaxed)
    }

    /// Writes that failed or were dropped
    pub fn durability_gaps(&self) -> u64 {
        self.counters.durability_gaps.load(Ordering::Relaxed)
    }
}

fn write_block(
    store: &dyn LedgerStore,
    block: &Block,
    accounts: &[Account],
    changes: &[StateChange],
    receipts: &[TransactionReceipt],
) -> Result<(), StoreError> {
    store.upsert_accounts(accounts)?;
    store.append_state_changes(changes)?;
    store.append_block(block)?;
    for tx in &block.transactions {
        store.append_transaction(tx, block.height())?;
    }
    store.append_receipts(receipts)?;
    Ok(())
}
