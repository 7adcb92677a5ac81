//! Fork Choice - longest chain with bounded reorganization
//!
//! The main chain is a contiguous vector of blocks from genesis. Competing
//! branches are tracked as side chains anchored at a main-chain ancestor.
//!
//! Rules:
//! - A side chain that becomes longer than the main chain is promoted.
//! - On equal length, the branch whose first diverging block has the
//!   earlier timestamp wins.
//! - Promotion is refused if it would discard more than `max_reorg_depth`
//!   blocks or any block buried `fork_choice_depth` deep (finalized).
//! - Blocks whose parent is unknown wait in a bounded orphan buffer and are
//!   connected as soon as the parent arrives.
//! - Side chains anchored more than `max_reorg_depth` below the tip are
//!   pruned.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::validity::ValidityGate;
use crate::config::ChainConfig;
use crate::protocol::{short, Block};

/// Blocks held while waiting for their parent
pub const MAX_ORPHANS: usize = 64;

/// Where a block ended up after fork choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    ExtendingMain,
    SideChain,
    Promoted,
    Orphaned,
    Pruned,
}

/// A competing branch: blocks after a main-chain ancestor, oldest first
#[derive(Debug, Clone)]
pub struct SideChain {
    pub ancestor_hash: String,
    pub ancestor_height: u64,
    pub blocks: Vec<Block>,
}

impl SideChain {
    fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    fn position(&self, hash: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.hash() == hash)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ForkSummary {
    pub tip_hash: String,
    pub tip_height: u64,
    pub ancestor_hash: String,
    pub ancestor_height: u64,
    pub length: usize,
    /// Main height minus side tip height (negative when a refused side chain is longer)
    pub height_diff: i64,
}

/// A completed switch of the main chain
#[derive(Debug, Clone, Serialize)]
pub struct Reorganization {
    pub old_tip: String,
    pub new_tip: String,
    /// Former main-chain blocks, oldest first
    pub orphaned: Vec<Block>,
    /// Blocks that became main chain, oldest first
    pub adopted: Vec<Block>,
    pub common_ancestor_height: u64,
    pub depth: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum ReorgRefusal {
    #[error("Reorg depth {depth} exceeds maximum {max}")]
    TooDeep { depth: u64, max: u64 },

    #[error("Reorg would discard finalized block at height {height}")]
    Finalized { height: u64 },
}

#[derive(Debug, Clone)]
pub enum ForkChoiceOutcome {
    ExtendedMain { height: u64 },
    SideChain {
        tip: String,
        length: usize,
        refused: Option<ReorgRefusal>,
    },
    Promoted(Reorganization),
    Orphaned { parent_hash: String },
    Duplicate,
    Invalid(String),
}

impl ForkChoiceOutcome {
    pub fn state(&self) -> Option<SegmentState> {
        match self {
            Self::ExtendedMain { .. } => Some(SegmentState::ExtendingMain),
            Self::SideChain { .. } => Some(SegmentState::SideChain),
            Self::Promoted(_) => Some(SegmentState::Promoted),
            Self::Orphaned { .. } => Some(SegmentState::Orphaned),
            Self::Duplicate | Self::Invalid(_) => None,
        }
    }

    /// True when the block is now part of the tracked tree
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::ExtendedMain { .. } | Self::SideChain { .. } | Self::Promoted(_)
        )
    }

    pub fn reorganization(&self) -> Option<&Reorganization> {
        match self {
            Self::Promoted(reorg) => Some(reorg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainStats {
    pub height: u64,
    pub length: usize,
    pub tip: String,
    pub side_chains: usize,
    pub orphans: usize,
    pub reorganizations: u64,
    pub refused_reorganizations: u64,
    pub pruned_side_chains: u64,
}

pub struct ChainManager {
    main: Vec<Block>,
    main_index: HashMap<String, usize>,
    /// Side chains keyed by tip hash
    forks: HashMap<String, SideChain>,
    /// Orphans keyed by the parent they wait for
    orphans: HashMap<String, Vec<Block>>,
    orphan_count: usize,
    /// Outcomes of orphans connected during the last `add_block`
    adopted: Vec<ForkChoiceOutcome>,
    fork_choice_depth: u64,
    max_reorg_depth: u64,
    gate: Option<Arc<ValidityGate>>,
    reorganizations: u64,
    refused: u64,
    pruned: u64,
}

impl ChainManager {
    pub fn new(genesis: Block, config: &ChainConfig) -> Self {
        let mut main_index = HashMap::new();
        main_index.insert(genesis.hash().to_string(), 0);
        Self {
            main: vec![genesis],
            main_index,
            forks: HashMap::new(),
            orphans: HashMap::new(),
            orphan_count: 0,
            adopted: Vec::new(),
            fork_choice_depth: config.fork_choice_depth,
            max_reorg_depth: config.max_reorg_depth,
            gate: None,
            reorganizations: 0,
            refused: 0,
            pruned: 0,
        }
    }

    /// Clear this gate's judgment cache whenever the main chain switches
    pub fn with_gate(mut self, gate: Arc<ValidityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    // ========================================================================
    // INSERTION
    // ========================================================================

    /// Run fork choice for one block.
    ///
    /// Orphans that this block connects are processed too; their outcomes
    /// are available from [`take_adopted`](Self::take_adopted).
    pub fn add_block(&mut self, block: Block) -> ForkChoiceOutcome {
        let hash = block.hash().to_string();
        let outcome = self.insert_block(block);
        if outcome.is_connected() {
            self.connect_orphans(hash);
            self.prune_side_chains();
        }
        outcome
    }

    /// Run fork choice for one block, leaving its buffered orphans in place.
    ///
    /// Callers that must check each orphan before it joins the tree take
    /// them with [`release_orphans`](Self::release_orphans).
    pub fn insert_block(&mut self, block: Block) -> ForkChoiceOutcome {
        let outcome = self.insert(block);
        if outcome.is_connected() {
            self.prune_side_chains();
        }
        outcome
    }

    /// Remove and return the orphans waiting on `parent_hash`
    pub fn release_orphans(&mut self, parent_hash: &str) -> Vec<Block> {
        let children = self.orphans.remove(parent_hash).unwrap_or_default();
        self.orphan_count = self.orphan_count.saturating_sub(children.len());
        children
    }

    /// Outcomes of orphans connected since the last call
    pub fn take_adopted(&mut self) -> Vec<ForkChoiceOutcome> {
        std::mem::take(&mut self.adopted)
    }

    fn insert(&mut self, block: Block) -> ForkChoiceOutcome {
        let hash = block.hash().to_string();
        if self.contains(&hash) {
            return ForkChoiceOutcome::Duplicate;
        }
        let parent_hash = block.parent_hash().to_string();

        let parent_height = self.get_block_by_hash(&parent_hash).map(|p| p.height());
        let Some(parent_height) = parent_height else {
            return self.buffer_orphan(block);
        };
        if block.height() != parent_height + 1 {
            return ForkChoiceOutcome::Invalid(format!(
                "height {} does not follow parent height {}",
                block.height(),
                parent_height
            ));
        }

        // Extends the main tip
        if self.tip_hash() == parent_hash {
            let height = block.height();
            self.main_index.insert(hash, self.main.len());
            self.main.push(block);
            return ForkChoiceOutcome::ExtendedMain { height };
        }

        // Branches off the main chain below the tip
        if let Some(&index) = self.main_index.get(&parent_hash) {
            self.forks.insert(
                hash.clone(),
                SideChain {
                    ancestor_hash: parent_hash,
                    ancestor_height: self.main[index].height(),
                    blocks: vec![block],
                },
            );
            return self.evaluate(&hash);
        }

        // Extends the tip of a side chain
        if let Some(mut side) = self.forks.remove(&parent_hash) {
            side.blocks.push(block);
            self.forks.insert(hash.clone(), side);
            return self.evaluate(&hash);
        }

        // Branches off the middle of a side chain
        let branched = self.forks.values().find_map(|side| {
            side.position(&parent_hash).map(|pos| SideChain {
                ancestor_hash: side.ancestor_hash.clone(),
                ancestor_height: side.ancestor_height,
                blocks: side.blocks[..=pos].to_vec(),
            })
        });
        match branched {
            Some(mut side) => {
                side.blocks.push(block);
                self.forks.insert(hash.clone(), side);
                self.evaluate(&hash)
            }
            None => self.buffer_orphan(block),
        }
    }

    fn buffer_orphan(&mut self, block: Block) -> ForkChoiceOutcome {
        let parent_hash = block.parent_hash().to_string();
        if self.orphan_count >= MAX_ORPHANS {
            warn!(
                block = %short(block.hash()),
                parent = %short(&parent_hash),
                "Orphan buffer full, dropping block"
            );
            return ForkChoiceOutcome::Orphaned { parent_hash };
        }
        debug!(
            block = %short(block.hash()),
            parent = %short(&parent_hash),
            "Buffered orphan block"
        );
        self.orphans.entry(parent_hash.clone()).or_default().push(block);
        self.orphan_count += 1;
        ForkChoiceOutcome::Orphaned { parent_hash }
    }

    fn connect_orphans(&mut self, connected: String) {
        let mut queue = vec![connected];
        while let Some(parent) = queue.pop() {
            for child in self.release_orphans(&parent) {
                let hash = child.hash().to_string();
                let outcome = self.insert(child);
                debug!(block = %short(&hash), state = ?outcome.state(), "Connected orphan");
                if outcome.is_connected() {
                    queue.push(hash);
                }
                self.adopted.push(outcome);
            }
        }
    }

    // ========================================================================
    // FORK CHOICE
    // ========================================================================

    fn evaluate(&mut self, tip_hash: &str) -> ForkChoiceOutcome {
        let Some(side) = self.forks.get(tip_hash) else {
            return ForkChoiceOutcome::Invalid(format!("unknown side chain {}", tip_hash));
        };
        let Some(&ancestor_index) = self.main_index.get(&side.ancestor_hash) else {
            return ForkChoiceOutcome::Invalid(format!(
                "side chain ancestor {} left the main chain",
                side.ancestor_hash
            ));
        };

        let side_length = ancestor_index + 1 + side.blocks.len();
        let main_length = self.main.len();
        let first_diverging = ancestor_index + 1;

        let longer = side_length > main_length;
        let tie_won = side_length == main_length
            && match (side.blocks.first(), self.main.get(first_diverging)) {
                (Some(ours), Some(theirs)) => ours.timestamp() < theirs.timestamp(),
                _ => false,
            };

        if !longer && !tie_won {
            return ForkChoiceOutcome::SideChain {
                tip: tip_hash.to_string(),
                length: side_length,
                refused: None,
            };
        }

        let depth = (main_length - first_diverging) as u64;
        let refusal = if depth > self.max_reorg_depth {
            Some(ReorgRefusal::TooDeep { depth, max: self.max_reorg_depth })
        } else if depth > 0 && self.is_final_index(first_diverging) {
            Some(ReorgRefusal::Finalized { height: self.main[first_diverging].height() })
        } else {
            None
        };

        if let Some(refusal) = refusal {
            self.refused += 1;
            warn!(
                tip = %short(tip_hash),
                depth,
                reason = %refusal,
                "Refused chain reorganization"
            );
            return ForkChoiceOutcome::SideChain {
                tip: tip_hash.to_string(),
                length: side_length,
                refused: Some(refusal),
            };
        }

        self.promote(tip_hash, ancestor_index)
    }

    fn promote(&mut self, tip_hash: &str, ancestor_index: usize) -> ForkChoiceOutcome {
        let Some(side) = self.forks.remove(tip_hash) else {
            return ForkChoiceOutcome::Invalid(format!("unknown side chain {}", tip_hash));
        };

        let orphaned = self.main.split_off(ancestor_index + 1);
        for block in &orphaned {
            self.main_index.remove(block.hash());
        }
        for block in &side.blocks {
            self.main_index.insert(block.hash().to_string(), self.main.len());
            self.main.push(block.clone());
        }

        let old_tip = orphaned
            .last()
            .map(|b| b.hash().to_string())
            .unwrap_or_else(|| side.ancestor_hash.clone());

        // The old main suffix stays tracked as a competing branch
        if !orphaned.is_empty() {
            self.forks.insert(
                old_tip.clone(),
                SideChain {
                    ancestor_hash: side.ancestor_hash.clone(),
                    ancestor_height: side.ancestor_height,
                    blocks: orphaned.clone(),
                },
            );
        }
        self.reanchor_side_chains();

        if let Some(gate) = &self.gate {
            gate.invalidate_cache();
        }
        self.reorganizations += 1;

        let reorg = Reorganization {
            old_tip,
            new_tip: tip_hash.to_string(),
            depth: orphaned.len() as u64,
            orphaned,
            adopted: side.blocks,
            common_ancestor_height: side.ancestor_height,
        };
        info!(
            old_tip = %short(&reorg.old_tip),
            new_tip = %short(&reorg.new_tip),
            depth = reorg.depth,
            common_ancestor = reorg.common_ancestor_height,
            "Chain reorganized"
        );
        ForkChoiceOutcome::Promoted(reorg)
    }

    /// After a switch some side chains hang off blocks that left the main
    /// chain. Rebuild each from its nearest ancestor still on main.
    fn reanchor_side_chains(&mut self) {
        loop {
            let detached: Vec<String> = self
                .forks
                .iter()
                .filter(|(_, side)| !self.main_index.contains_key(&side.ancestor_hash))
                .map(|(tip, _)| tip.clone())
                .collect();
            if detached.is_empty() {
                return;
            }

            let mut progressed = false;
            for tip in detached {
                let Some(side) = self.forks.get(&tip) else { continue };
                let ancestor = side.ancestor_hash.clone();

                let host = self.forks.iter().find_map(|(other_tip, other)| {
                    if *other_tip == tip {
                        return None;
                    }
                    other.position(&ancestor).map(|pos| SideChain {
                        ancestor_hash: other.ancestor_hash.clone(),
                        ancestor_height: other.ancestor_height,
                        blocks: other.blocks[..=pos].to_vec(),
                    })
                });

                match host {
                    Some(mut prefix) => {
                        if let Some(side) = self.forks.get_mut(&tip) {
                            prefix.blocks.append(&mut side.blocks);
                            *side = prefix;
                            progressed = true;
                        }
                    }
                    None => {
                        if self.forks.remove(&tip).is_some() {
                            self.pruned += 1;
                            warn!(tip = %short(&tip), "Dropped side chain with no surviving ancestor");
                            progressed = true;
                        }
                    }
                }
            }
            if !progressed {
                return;
            }
        }
    }

    fn prune_side_chains(&mut self) {
        let tip_height = self.height();
        let max = self.max_reorg_depth;
        let before = self.forks.len();
        self.forks.retain(|tip, side| {
            let keep = side.ancestor_height + max >= tip_height;
            if !keep {
                debug!(tip = %short(tip), ancestor = side.ancestor_height, "Pruned side chain");
            }
            keep
        });
        self.pruned += (before - self.forks.len()) as u64;
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    fn contains(&self, hash: &str) -> bool {
        self.get_block_by_hash(hash).is_some()
            || self
                .orphans
                .values()
                .any(|blocks| blocks.iter().any(|b| b.hash() == hash))
    }

    fn is_final_index(&self, index: usize) -> bool {
        (self.main.len() - index - 1) as u64 >= self.fork_choice_depth
    }

    pub fn genesis(&self) -> &Block {
        &self.main[0]
    }

    pub fn latest_block(&self) -> &Block {
        &self.main[self.main.len() - 1]
    }

    pub fn tip_hash(&self) -> &str {
        self.latest_block().hash()
    }

    pub fn height(&self) -> u64 {
        self.latest_block().height()
    }

    /// Number of blocks on the main chain, genesis included
    pub fn chain_length(&self) -> usize {
        self.main.len()
    }

    pub fn main_chain(&self) -> &[Block] {
        &self.main
    }

    /// The last `count` main-chain blocks, oldest first
    pub fn recent_blocks(&self, count: usize) -> &[Block] {
        let start = self.main.len().saturating_sub(count);
        &self.main[start..]
    }

    pub fn get_block_by_height(&self, height: u64) -> Option<&Block> {
        let offset = height.checked_sub(self.genesis().height())?;
        self.main.get(offset as usize)
    }

    /// Main chain first, then side chains
    pub fn get_block_by_hash(&self, hash: &str) -> Option<&Block> {
        if let Some(&index) = self.main_index.get(hash) {
            return self.main.get(index);
        }
        self.forks
            .values()
            .find_map(|side| side.blocks.iter().find(|b| b.hash() == hash))
    }

    /// Blocks from genesis through `hash`, along whichever branch holds it
    pub fn path_to(&self, hash: &str) -> Option<Vec<Block>> {
        if let Some(&index) = self.main_index.get(hash) {
            return Some(self.main[..=index].to_vec());
        }
        self.forks.values().find_map(|side| {
            let pos = side.position(hash)?;
            let ancestor = *self.main_index.get(&side.ancestor_hash)?;
            let mut path = self.main[..=ancestor].to_vec();
            path.extend_from_slice(&side.blocks[..=pos]);
            Some(path)
        })
    }

    pub fn is_main_chain(&self, hash: &str) -> bool {
        self.main_index.contains_key(hash)
    }

    /// Main-chain block buried at least `fork_choice_depth` deep
    pub fn is_finalized(&self, hash: &str) -> bool {
        self.main_index
            .get(hash)
            .map(|&index| self.is_final_index(index))
            .unwrap_or(false)
    }

    /// Highest finalized main-chain block
    pub fn finalized_height(&self) -> Option<u64> {
        let depth = self.fork_choice_depth as usize;
        let index = self.main.len().checked_sub(depth + 1)?;
        Some(self.main[index].height())
    }

    pub fn active_forks(&self) -> Vec<ForkSummary> {
        let main_height = self.height();
        let mut forks: Vec<ForkSummary> = self
            .forks
            .iter()
            .filter_map(|(tip_hash, side)| {
                let tip = side.tip()?;
                Some(ForkSummary {
                    tip_hash: tip_hash.clone(),
                    tip_height: tip.height(),
                    ancestor_hash: side.ancestor_hash.clone(),
                    ancestor_height: side.ancestor_height,
                    length: side.blocks.len(),
                    height_diff: main_height as i64 - tip.height() as i64,
                })
            })
            .collect();
        forks.sort_by(|a, b| b.tip_height.cmp(&a.tip_height).then(a.tip_hash.cmp(&b.tip_hash)));
        forks
    }

    pub fn orphan_count(&self) -> usize {
        self.orphan_count
    }

    pub fn stats(&self) -> ChainStats {
        ChainStats {
            height: self.height(),
            length: self.main.len(),
            tip: self.tip_hash().to_string(),
            side_chains: self.forks.len(),
            orphans: self.orphan_count,
            reorganizations: self.reorganizations,
            refused_reorganizations: self.refused,
            pruned_side_chains: self.pruned,
        }
    }
}
