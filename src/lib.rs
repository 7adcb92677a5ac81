//! Ledger Core
//!
//! Single-writer account ledger: signed transfers are admitted into a pool,
//! assembled into blocks, committed to a Merkle-rooted account state, and
//! ordered by longest-chain fork choice with bounded reorganization.
//!
//! ## Layout
//!
//! - **crypto**: base58, Ed25519 keys and signatures, Merkle folding
//! - **protocol**: accounts, transactions, blocks, state changes
//! - **ledger**: committed/working account state and state roots
//! - **pool**: admission checks and pending transactions
//! - **consensus**: validity gate, judges, difficulty, fork choice
//! - **receipts**: receipts, logs and bloom filters
//! - **runtime**: block producer and validator set
//! - **storage**: store trait, memory/redb drivers, cache, persister
//! - **node**: everything wired together

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod error;
pub mod events;
pub mod ledger;
pub mod node;
pub mod pool;
pub mod receipts;
pub mod storage;

#[path = "../protocol/mod.rs"]
pub mod protocol;
#[path = "../runtime/mod.rs"]
pub mod runtime;

// ============================================================================
// PUBLIC API
// ============================================================================

pub use config::{ChainConfig, ConfigError, NodeConfig, PoolConfig, ProducerConfig, StorageConfig};
pub use consensus::{
    BlockJudge, ChainManager, ForkChoiceOutcome, GateRejection, HeuristicJudge, Judgment, Reorganization,
    ReorgRefusal, StaticJudge, ValidityGate,
};
pub use crypto::{CryptoError, Keypair};
pub use error::{Error, Result};
pub use events::{EventBus, LedgerEvent};
pub use ledger::{GenesisConfig, LedgerError, LedgerState};
pub use node::{Node, NodeError};
pub use pool::{AdmissionError, AdmissionPool, ValidationResult};
pub use protocol::{Account, Block, BlockHeader, StateChange, Transaction, UnsignedTransaction};
pub use receipts::{ReceiptIndex, TransactionReceipt, TransactionStatus};
pub use runtime::{BlockProducer, ProducerError, Validator, ValidatorSet};
pub use storage::{LedgerStore, MemoryStore, Persister, RedbStore, StoreError};
