//! Ledger protocol types
//!
//! - Account, Transaction, Block and StateChange records
//! - Canonical encoding and time helpers

pub mod helpers;
pub mod types;

pub use helpers::{canonical_bytes, now_millis, short};
pub use types::{
    Account, Block, BlockHeader, StateChange, Transaction, UnsignedTransaction,
    GENESIS_PARENT_HASH, GENESIS_PRODUCER,
};
