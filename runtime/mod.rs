//! Ledger runtime
//!
//! - Block production: one assemble/validate/commit cycle per tick
//! - Validator set: producer rotation and the approval quorum

pub mod producer;
pub mod validators;

pub use producer::{
    build_genesis_block, run_block_producer, BlockProducer, ChainHandles, ProducedBlock, ProducerError,
    ProducerStats,
};
pub use validators::{QuorumResult, Validator, ValidatorSet, Vote};
