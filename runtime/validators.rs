//! Validator set: round-robin producer rotation and block approval quorum.
//!
//! Each validator carries its own [`BlockJudge`]. When a block is proposed,
//! every active validator except the producer judges it; the block needs
//! `ceil(voters × quorum_ratio)` approvals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::consensus::{BlockJudge, JudgeContext, Judgment, ValidityGate};
use crate::crypto::Keypair;
use crate::protocol::Block;

#[derive(Clone)]
pub struct Validator {
    pub address: String,
    pub name: String,
    pub active: bool,
    pub blocks_produced: u64,
    judge: Arc<dyn BlockJudge>,
}

impl Validator {
    pub fn new(address: impl Into<String>, name: impl Into<String>, judge: Arc<dyn BlockJudge>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            active: true,
            blocks_produced: 0,
            judge,
        }
    }

    /// Validator with a freshly generated ed25519 address
    pub fn generate(name: impl Into<String>, judge: Arc<dyn BlockJudge>) -> Self {
        let keypair = Keypair::generate();
        Self::new(keypair.public_key, name, judge)
    }

    pub async fn judge(&self, block: &Block, ctx: JudgeContext<'_>) -> Judgment {
        self.judge.judge(block, ctx).await
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("active", &self.active)
            .field("blocks_produced", &self.blocks_produced)
            .field("judge", &self.judge.name())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Vote {
    pub validator: String,
    pub approve: bool,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuorumResult {
    pub votes: Vec<Vote>,
    pub approvals: usize,
    pub required: usize,
}

impl QuorumResult {
    pub fn reached(&self) -> bool {
        self.approvals >= self.required
    }
}

#[derive(Debug)]
pub struct ValidatorSet {
    validators: RwLock<Vec<Validator>>,
    cursor: AtomicUsize,
    quorum_ratio: f64,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Validator>, quorum_ratio: f64) -> Self {
        info!(validators = validators.len(), quorum_ratio, "Validator set initialized");
        Self {
            validators: RwLock::new(validators),
            cursor: AtomicUsize::new(0),
            quorum_ratio,
        }
    }

    pub fn len(&self) -> usize {
        self.validators.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.read().is_empty()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.validators.read().iter().map(|v| v.address.clone()).collect()
    }

    pub fn add(&self, validator: Validator) {
        self.validators.write().push(validator);
    }

    /// Returns false for an unknown address
    pub fn set_active(&self, address: &str, active: bool) -> bool {
        let mut validators = self.validators.write();
        match validators.iter_mut().find(|v| v.address == address) {
            Some(v) => {
                v.active = active;
                true
            }
            None => false,
        }
    }

    pub fn record_block_produced(&self, address: &str) {
        if let Some(v) = self.validators.write().iter_mut().find(|v| v.address == address) {
            v.blocks_produced += 1;
        }
    }

    pub fn blocks_produced(&self, address: &str) -> u64 {
        self.validators
            .read()
            .iter()
            .find(|v| v.address == address)
            .map_or(0, |v| v.blocks_produced)
    }

    /// Next active validator in rotation
    pub fn next_producer(&self) -> Option<Validator> {
        let validators = self.validators.read();
        let count = validators.len();
        for _ in 0..count {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
            if validators[index].active {
                return Some(validators[index].clone());
            }
        }
        None
    }

    /// Approvals needed from `voters` validators
    pub fn required_approvals(&self, voters: usize) -> usize {
        (voters as f64 * self.quorum_ratio).ceil() as usize
    }

    /// Ask every active validator other than the producer to judge `block`
    pub async fn collect_votes(&self, block: &Block, ctx: JudgeContext<'_>, gate: &ValidityGate) -> QuorumResult {
        let voters: Vec<Validator> = self
            .validators
            .read()
            .iter()
            .filter(|v| v.active && v.address != block.header.producer)
            .cloned()
            .collect();

        let mut votes = Vec::with_capacity(voters.len());
        for validator in &voters {
            let judgment = validator.judge(block, ctx).await;
            let approve = gate.evaluate(&judgment).is_ok();
            debug!(
                validator = %validator.name,
                height = block.height(),
                approve,
                "Validator vote"
            );
            votes.push(Vote {
                validator: validator.address.clone(),
                approve,
                reasoning: judgment.reasoning,
            });
        }

        let approvals = votes.iter().filter(|v| v.approve).count();
        QuorumResult {
            required: self.required_approvals(votes.len()),
            approvals,
            votes,
        }
    }
}
