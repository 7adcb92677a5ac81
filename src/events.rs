//! Fire-and-forget ledger events over a broadcast channel.
//!
//! Publishing never blocks and never fails the caller: with no subscribers
//! the event is dropped, and slow subscribers see `Lagged` on their side.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    TransactionAdmitted {
        hash: String,
        from: String,
        to: String,
        value: u128,
    },
    BlockProduced {
        height: u64,
        hash: String,
        producer: String,
        transactions: usize,
        state_root: String,
    },
    ConsensusFailed {
        height: u64,
        producer: String,
        reason: String,
        returned_transactions: usize,
    },
    ChainReorganized {
        old_tip: String,
        new_tip: String,
        /// Hashes of the blocks that left the main chain
        discarded: Vec<String>,
        common_ancestor_height: u64,
    },
}

impl LedgerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransactionAdmitted { .. } => "transaction_admitted",
            Self::BlockProduced { .. } => "block_produced",
            Self::ConsensusFailed { .. } => "consensus_failed",
            Self::ChainReorganized { .. } => "chain_reorganized",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    /// Number of listeners that received the event
    pub fn publish(&self, event: LedgerEvent) -> usize {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(delivered) => delivered,
            Err(_) => {
                trace!(event = kind, "No subscribers for event");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
