//! Crate-level error.

use thiserror::Error;

use crate::config::ConfigError;
use crate::consensus::{GateRejection, ReorgRefusal};
use crate::crypto::CryptoError;
use crate::ledger::LedgerError;
use crate::node::NodeError;
use crate::pool::AdmissionError;
use crate::runtime::ProducerError;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Gate(#[from] GateRejection),

    #[error(transparent)]
    Reorg(#[from] ReorgRefusal),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Producer(#[from] ProducerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
