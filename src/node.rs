// ============================================================================
// NODE
// ============================================================================
//
// Wires every component into one owned instance and exposes the external
// surface: transaction submission, account/block/receipt queries, block
// import, block production and event subscription.
//
//   submit_transaction ──▶ AdmissionPool ──▶ BlockProducer ──┐
//                                                            ▼
//   import_block ──▶ ValidityGate ──▶ ledger replay ──▶ ChainManager
//                                                            │
//              ReceiptIndex ◀── Persister ◀── EventBus ◀─────┘
//
// Production and import serialize on one writer lock, so the ledger always
// reflects the main chain tip between operations.
//
// ============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, NodeConfig, StorageConfig};
use crate::consensus::{
    BlockJudge, ChainManager, ChainStats, ForkChoiceOutcome, ForkSummary, GateContext, GateRejection, GateStats,
    Reorganization, ValidityGate,
};
use crate::events::{EventBus, LedgerEvent};
use crate::ledger::{CommitSummary, GenesisConfig, LedgerError, LedgerState};
use crate::pool::{AdmissionPool, PoolStats, ValidationResult};
use crate::protocol::{now_millis, short, Account, Block, Transaction};
use crate::receipts::{
    build_block_receipts, calculate_receipts_root, stamp_sealed_block, LogEntry, ReceiptIndex, TransactionReceipt,
};
use crate::runtime::{
    build_genesis_block, run_block_producer, BlockProducer, ChainHandles, ProducedBlock, ProducerError, Validator,
    ValidatorSet,
};
use crate::storage::{
    CachedStore, FastCache, LedgerStore, MemoryStore, PersistJob, Persister, RedbStore, StoreError,
    StoredTransaction,
};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Gate(#[from] GateRejection),

    #[error("Receipts root mismatch: block has {claimed}, computed {computed}")]
    ReceiptsRootMismatch { claimed: String, computed: String },

    #[error("Block rejected by fork choice: {0}")]
    ForkChoice(String),

    #[error("Store holds genesis {stored}, but this configuration builds {built}")]
    GenesisMismatch { stored: String, built: String },
}

pub struct Node {
    config: NodeConfig,
    handles: ChainHandles,
    producer: Arc<BlockProducer>,
    store: Arc<dyn LedgerStore>,
    cache: Option<Arc<FastCache>>,
    persister: Persister,
    persister_task: JoinHandle<()>,
}

impl Node {
    /// Node with a single local validator judging with `judge`.
    ///
    /// Must be called inside a Tokio runtime (the persister is spawned).
    pub fn new(config: NodeConfig, genesis: GenesisConfig, judge: Arc<dyn BlockJudge>) -> Result<Self, NodeError> {
        let local = Validator::generate("local", Arc::clone(&judge));
        Self::with_validators(config, genesis, judge, vec![local])
    }

    pub fn with_validators(
        config: NodeConfig,
        genesis: GenesisConfig,
        judge: Arc<dyn BlockJudge>,
        validators: Vec<Validator>,
    ) -> Result<Self, NodeError> {
        config.validate()?;

        let (store, cache) = open_store(&config.storage)?;
        let (persister, persister_task) = Persister::spawn(Arc::clone(&store));

        let ledger = Arc::new(LedgerState::new());
        let genesis_block = build_genesis_block(&ledger, &genesis)?;
        let stored = load_main_chain(store.as_ref())?;
        match stored.first() {
            Some(stored_genesis) if stored_genesis.hash() != genesis_block.hash() => {
                return Err(NodeError::GenesisMismatch {
                    stored: stored_genesis.hash().to_string(),
                    built: genesis_block.hash().to_string(),
                });
            }
            Some(_) => {}
            None => {
                persister.submit(PersistJob::Block {
                    block: genesis_block.clone(),
                    accounts: ledger.accounts(),
                    changes: ledger.recent_state_changes(genesis.allocations.len()),
                    receipts: Vec::new(),
                });
            }
        }

        let gate = Arc::new(ValidityGate::new(judge, &config.chain, &config.producer));
        let chain = ChainManager::new(genesis_block, &config.chain).with_gate(Arc::clone(&gate));
        let pool = Arc::new(AdmissionPool::new(Arc::clone(&ledger), config.pool.clone()));

        let handles = ChainHandles {
            ledger,
            pool,
            gate,
            chain: Arc::new(RwLock::new(chain)),
            receipts: Arc::new(ReceiptIndex::new()),
            events: EventBus::default(),
            persister: Some(persister.clone()),
            writer: Arc::new(tokio::sync::Mutex::new(())),
        };

        let validators = Arc::new(ValidatorSet::new(validators, config.chain.quorum_ratio));
        let producer = Arc::new(BlockProducer::new(handles.clone(), validators, &config));

        info!(
            state_root = %short(&handles.ledger.state_root()),
            persistent = config.storage.data_dir.is_some(),
            fast_cache = cache.is_some(),
            judge = handles.gate.judge_name(),
            "Node initialized"
        );

        let node = Self { config, handles, producer, store, cache, persister, persister_task };
        if stored.len() > 1 {
            node.recover(&stored[1..]);
        }
        Ok(node)
    }

    /// Replay stored main-chain blocks on top of genesis.
    ///
    /// Stops at the first block that fails replay; the chain and ledger
    /// end at its parent.
    fn recover(&self, blocks: &[Block]) {
        let handles = &self.handles;
        let reward = self.config.producer.block_reward;

        let mut recovered = 0;
        for block in blocks {
            let snapshot = handles.ledger.snapshot();
            if let Err(e) = handles.ledger.replay_block(block, reward) {
                warn!(height = block.height(), error = %e, "Stored block failed replay, recovery stops here");
                break;
            }
            let outcome = handles.chain.write().insert_block(block.clone());
            if !matches!(outcome, ForkChoiceOutcome::ExtendedMain { .. }) {
                handles.ledger.restore(snapshot);
                warn!(height = block.height(), state = ?outcome.state(), "Stored block did not extend the chain");
                break;
            }

            let hashes: Vec<String> = block.transactions.iter().map(|tx| tx.hash.clone()).collect();
            handles.pool.remove_transactions(&hashes);
            handles.receipts.store_block(stamped_receipts(block));
            recovered += 1;
        }

        let difficulty = handles.gate.recompute_difficulty(handles.chain.read().main_chain());

        let drifted = handles
            .ledger
            .accounts()
            .into_iter()
            .filter(|account| match self.store.get_account(&account.address) {
                Ok(Some(stored)) => stored.balance != account.balance || stored.nonce != account.nonce,
                _ => true,
            })
            .count();
        if drifted > 0 {
            warn!(drifted, "Stored accounts differ from replayed state, rewriting them");
        }
        handles.persist(PersistJob::Accounts(handles.ledger.accounts()));

        info!(
            height = handles.chain.read().height(),
            recovered,
            skipped = blocks.len() - recovered,
            difficulty,
            state_root = %short(&handles.ledger.state_root()),
            "Recovered chain from store"
        );
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<LedgerState> {
        &self.handles.ledger
    }

    pub fn pool(&self) -> &Arc<AdmissionPool> {
        &self.handles.pool
    }

    pub fn gate(&self) -> &Arc<ValidityGate> {
        &self.handles.gate
    }

    pub fn producer(&self) -> &Arc<BlockProducer> {
        &self.producer
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<FastCache>> {
        self.cache.as_ref()
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    pub fn submit_transaction(&self, tx: Transaction) -> ValidationResult {
        let (hash, from, to, value) = (tx.hash.clone(), tx.from.clone(), tx.to.clone(), tx.value);
        let result = self.handles.pool.add_transaction(tx);
        if result.valid {
            self.handles
                .events
                .publish(LedgerEvent::TransactionAdmitted { hash, from, to, value });
        }
        result
    }

    /// Transaction confirmed on the current main chain, with its block height
    pub fn get_transaction(&self, hash: &str) -> Result<Option<StoredTransaction>, NodeError> {
        let Some(stored) = self.store.get_transaction(hash)? else {
            return Ok(None);
        };
        let on_main = self
            .handles
            .chain
            .read()
            .get_block_by_height(stored.block_height)
            .is_some_and(|block| block.transactions.iter().any(|tx| tx.hash == hash));
        Ok(on_main.then_some(stored))
    }

    pub fn prune_pool(&self) -> usize {
        self.handles.pool.prune_expired(now_millis())
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.handles.pool.stats()
    }

    // ========================================================================
    // ACCOUNTS
    // ========================================================================

    pub fn get_account(&self, address: &str) -> Option<Account> {
        self.handles.ledger.get_account(address)
    }

    pub fn get_balance(&self, address: &str) -> u128 {
        self.handles.ledger.get_balance(address)
    }

    pub fn get_nonce(&self, address: &str) -> u64 {
        self.handles.ledger.get_nonce(address)
    }

    pub fn state_root(&self) -> String {
        self.handles.ledger.state_root()
    }

    // ========================================================================
    // BLOCKS
    // ========================================================================

    pub fn get_block_by_height(&self, height: u64) -> Option<Block> {
        self.handles.chain.read().get_block_by_height(height).cloned()
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Option<Block> {
        self.handles.chain.read().get_block_by_hash(hash).cloned()
    }

    pub fn get_latest_block(&self) -> Block {
        self.handles.chain.read().latest_block().clone()
    }

    pub fn height(&self) -> u64 {
        self.handles.chain.read().height()
    }

    pub fn is_finalized(&self, hash: &str) -> bool {
        self.handles.chain.read().is_finalized(hash)
    }

    pub fn finalized_height(&self) -> Option<u64> {
        self.handles.chain.read().finalized_height()
    }

    pub fn active_forks(&self) -> Vec<ForkSummary> {
        self.handles.chain.read().active_forks()
    }

    pub fn chain_stats(&self) -> ChainStats {
        self.handles.chain.read().stats()
    }

    pub fn gate_stats(&self) -> GateStats {
        self.handles.gate.stats()
    }

    // ========================================================================
    // RECEIPTS
    // ========================================================================

    /// Indexed receipt, falling back to the store for main-chain blocks
    pub fn get_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, NodeError> {
        if let Some(receipt) = self.handles.receipts.get_receipt(tx_hash) {
            return Ok(Some(receipt));
        }
        let stored = self.store.get_receipt(tx_hash)?;
        let chain = self.handles.chain.read();
        Ok(stored.filter(|receipt| chain.is_main_chain(&receipt.block_hash)))
    }

    pub fn get_receipts_for_block(&self, height: u64) -> Vec<TransactionReceipt> {
        self.handles.receipts.get_block_receipts(height)
    }

    pub fn logs_matching(&self, height: u64, topic: &str) -> Vec<LogEntry> {
        self.handles.receipts.logs_matching(height, topic)
    }

    // ========================================================================
    // EVENTS / PERSISTENCE
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.handles.events.subscribe()
    }

    /// Wait for every queued write to reach the store
    pub async fn flush(&self) {
        self.persister.flush().await;
    }

    pub fn durability_gaps(&self) -> u64 {
        self.persister.durability_gaps()
    }

    /// Flush queued writes and wait until the writer task releases the store.
    /// A loop started with [`spawn_producer`](Self::spawn_producer) must have
    /// stopped first, or the writer never sees its channel close.
    pub async fn shutdown(self) {
        self.persister.flush().await;
        let Self { handles, producer, store, cache, persister, persister_task, .. } = self;
        drop((handles, producer, store, cache, persister));
        if let Err(e) = persister_task.await {
            warn!(error = %e, "Persister task ended abnormally");
        }
    }

    // ========================================================================
    // PRODUCTION
    // ========================================================================

    pub async fn produce_block(&self) -> Result<ProducedBlock, ProducerError> {
        self.producer.produce_block().await
    }

    /// Run the production loop on its own task
    pub fn spawn_producer(&self) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.producer.block_interval_ms);
        tokio::spawn(run_block_producer(Arc::clone(&self.producer), interval))
    }

    // ========================================================================
    // IMPORT
    // ========================================================================

    /// Validate an externally produced block and run fork choice on it.
    ///
    /// A block extending the tip is replayed on the ledger first, so a bad
    /// state root rejects it. A block on a branch is replayed on a scratch
    /// ledger from its fork point. Promotion rebuilds the ledger along the
    /// new main chain. A block whose parent is unknown is buffered, and is
    /// imported with the same checks once the parent connects.
    pub async fn import_block(&self, block: Block) -> Result<ForkChoiceOutcome, NodeError> {
        let _writer = self.handles.writer.lock().await;
        let hash = block.hash().to_string();
        let outcome = self.import_one(block).await?;
        if outcome.is_connected() {
            let adopted = self.import_orphans_of(hash.clone()).await;
            if adopted > 0 {
                debug!(block = %short(&hash), adopted, "Connected buffered orphans");
            }
        }
        Ok(outcome)
    }

    async fn import_one(&self, block: Block) -> Result<ForkChoiceOutcome, NodeError> {
        let window = self.config.chain.difficulty_adjustment_interval as usize + 1;

        let (path, extends_tip) = {
            let chain = self.handles.chain.read();
            if chain.get_block_by_hash(block.hash()).is_some() {
                return Ok(ForkChoiceOutcome::Duplicate);
            }
            (chain.path_to(block.parent_hash()), chain.tip_hash() == block.parent_hash())
        };

        let Some(path) = path else {
            // Judged once its parent is known
            let ctx = GateContext { parent: None, recent: &[], expected_state_root: None };
            self.handles.gate.check_structure(&block, ctx)?;
            return Ok(self.handles.chain.write().insert_block(block));
        };

        let recent = &path[path.len().saturating_sub(window)..];
        let ctx = GateContext { parent: path.last(), recent, expected_state_root: None };
        self.handles.gate.validate(&block, ctx).await?;

        let computed = calculate_receipts_root(&build_block_receipts(&block.transactions, block.height()));
        if computed != block.header.receipts_root {
            warn!(block = %short(block.hash()), "Imported block has wrong receipts root");
            return Err(NodeError::ReceiptsRootMismatch {
                claimed: block.header.receipts_root.clone(),
                computed,
            });
        }

        let reward = self.config.producer.block_reward;
        let mut applied: Option<(CommitSummary, _)> = None;
        if extends_tip {
            let snapshot = self.handles.ledger.snapshot();
            let summary = self.handles.ledger.replay_block(&block, reward)?;
            applied = Some((summary, snapshot));
        } else {
            self.replay_branch(&path, &block)?;
        }

        let outcome = self.handles.chain.write().insert_block(block.clone());

        match (&outcome, applied) {
            (ForkChoiceOutcome::ExtendedMain { .. }, Some((summary, _))) => {
                self.on_main_extended(&block, summary);
            }
            (_, Some((_, snapshot))) => {
                // Replayed but not appended: undo
                self.handles.ledger.restore(snapshot);
            }
            (ForkChoiceOutcome::Promoted(reorg), None) => {
                self.on_reorganized(reorg)?;
            }
            _ => {}
        }

        if let ForkChoiceOutcome::Invalid(reason) = &outcome {
            return Err(NodeError::ForkChoice(reason.clone()));
        }
        debug!(
            block = %short(block.hash()),
            height = block.height(),
            state = ?outcome.state(),
            "Block imported"
        );
        Ok(outcome)
    }

    /// Import the orphans waiting on `parent`, then theirs, and so on.
    /// An orphan that fails import is dropped with everything buffered behind it.
    async fn import_orphans_of(&self, parent: String) -> usize {
        let mut queue = VecDeque::from([parent]);
        let mut adopted = 0;
        while let Some(parent) = queue.pop_front() {
            let children = self.handles.chain.write().release_orphans(&parent);
            for child in children {
                let hash = child.hash().to_string();
                match self.import_one(child).await {
                    Ok(outcome) if outcome.is_connected() => {
                        adopted += 1;
                        queue.push_back(hash);
                    }
                    Ok(outcome) => {
                        debug!(block = %short(&hash), state = ?outcome.state(), "Released orphan not connected");
                    }
                    Err(e) => {
                        let dropped = self.drop_orphans_of(&hash);
                        warn!(
                            block = %short(&hash),
                            error = %e,
                            dropped,
                            "Released orphan failed import, discarding its descendants"
                        );
                    }
                }
            }
        }
        adopted
    }

    fn drop_orphans_of(&self, hash: &str) -> usize {
        let mut chain = self.handles.chain.write();
        let mut queue = vec![hash.to_string()];
        let mut dropped = 0;
        while let Some(parent) = queue.pop() {
            for child in chain.release_orphans(&parent) {
                dropped += 1;
                queue.push(child.hash().to_string());
            }
        }
        dropped
    }

    /// Replay the side-chain part of `path` and then `block` on a scratch
    /// ledger rewound to the fork point
    fn replay_branch(&self, path: &[Block], block: &Block) -> Result<(), NodeError> {
        let reward = self.config.producer.block_reward;
        let fork_point = {
            let chain = self.handles.chain.read();
            path.iter().rposition(|b| chain.is_main_chain(b.hash())).unwrap_or(0)
        };
        let base_height = path.get(fork_point).map_or(0, Block::height);

        let scratch = self.handles.ledger.state_at(base_height)?;
        for ancestor in path.iter().skip(fork_point + 1) {
            scratch.replay_block(ancestor, reward)?;
        }
        scratch.replay_block(block, reward)?;
        Ok(())
    }

    fn on_main_extended(&self, block: &Block, summary: CommitSummary) {
        let handles = &self.handles;
        let window = self.config.chain.difficulty_adjustment_interval as usize + 1;
        handles.gate.record_accepted(block, &handles.recent_blocks(window));

        let hashes: Vec<String> = block.transactions.iter().map(|tx| tx.hash.clone()).collect();
        handles.pool.remove_transactions(&hashes);

        let receipts = stamped_receipts(block);
        handles.receipts.store_block(receipts.iter().cloned());
        handles.persist(PersistJob::Block {
            block: block.clone(),
            accounts: summary.accounts,
            changes: summary.changes,
            receipts,
        });
        info!(height = block.height(), hash = %short(block.hash()), "Imported block extended main chain");
    }

    /// Rebuild the ledger along the new main chain and move transactions
    /// and receipts across
    fn on_reorganized(&self, reorg: &Reorganization) -> Result<(), NodeError> {
        let handles = &self.handles;
        let reward = self.config.producer.block_reward;
        let main = handles.chain.read().main_chain().to_vec();

        let rebuilt = handles.ledger.state_at(reorg.common_ancestor_height).and_then(|scratch| {
            reorg
                .adopted
                .iter()
                .try_for_each(|block| scratch.replay_block(block, reward).map(|_| ()))
                .map(|()| scratch)
        });
        match rebuilt {
            Ok(scratch) => handles.ledger.install(scratch),
            Err(e) => {
                error!(
                    new_tip = %short(&reorg.new_tip),
                    error = %e,
                    "Ledger rebuild failed after reorganization, keeping previous state"
                );
                return Err(e.into());
            }
        }
        handles.gate.recompute_difficulty(&main);
        handles.persist(PersistJob::Accounts(handles.ledger.accounts()));

        for block in &reorg.orphaned {
            handles.receipts.remove_block(block.height());
        }
        let mut confirmed = HashSet::new();
        for block in &reorg.adopted {
            confirmed.extend(block.transactions.iter().map(|tx| tx.hash.clone()));
            let receipts = stamped_receipts(block);
            handles.receipts.store_block(receipts.iter().cloned());
            handles.persist(PersistJob::Block {
                block: block.clone(),
                accounts: Vec::new(),
                changes: Vec::new(),
                receipts,
            });
        }

        let confirmed_hashes: Vec<String> = confirmed.iter().cloned().collect();
        handles.pool.remove_transactions(&confirmed_hashes);
        let displaced: Vec<Transaction> = reorg
            .orphaned
            .iter()
            .flat_map(|block| block.transactions.iter())
            .filter(|tx| !confirmed.contains(&tx.hash))
            .cloned()
            .collect();
        let displaced_count = displaced.len();
        let reinstated = handles.pool.reinstate(displaced);

        handles.events.publish(LedgerEvent::ChainReorganized {
            old_tip: reorg.old_tip.clone(),
            new_tip: reorg.new_tip.clone(),
            discarded: reorg.orphaned.iter().map(|b| b.hash().to_string()).collect(),
            common_ancestor_height: reorg.common_ancestor_height,
        });
        warn!(
            old_tip = %short(&reorg.old_tip),
            new_tip = %short(&reorg.new_tip),
            depth = reorg.depth,
            displaced = displaced_count,
            reinstated,
            state_root = %short(&handles.ledger.state_root()),
            "Chain reorganized, ledger rebuilt"
        );
        Ok(())
    }
}

fn stamped_receipts(block: &Block) -> Vec<TransactionReceipt> {
    let mut receipts = build_block_receipts(&block.transactions, block.height());
    stamp_sealed_block(&mut receipts, block.hash(), &block.header.state_root);
    receipts
}

/// Main-chain blocks recorded in `store`, genesis first, up to the first
/// gap or broken parent link
fn load_main_chain(store: &dyn LedgerStore) -> Result<Vec<Block>, StoreError> {
    let Some(latest) = store.latest_height()? else {
        return Ok(Vec::new());
    };
    let mut blocks: Vec<Block> = Vec::new();
    for height in 0..=latest {
        let Some(block) = store.get_block_by_height(height)? else {
            warn!(height, latest, "Stored chain has a gap, recovering up to it");
            break;
        };
        if let Some(parent) = blocks.last() {
            if block.parent_hash() != parent.hash() {
                warn!(height, "Stored block does not link to its parent, recovering up to it");
                break;
            }
        }
        blocks.push(block);
    }
    Ok(blocks)
}

fn open_store(config: &StorageConfig) -> Result<(Arc<dyn LedgerStore>, Option<Arc<FastCache>>), StoreError> {
    Ok(match (&config.data_dir, config.fast_cache) {
        (Some(dir), true) => {
            let store = CachedStore::new(RedbStore::open(dir)?);
            let cache = Arc::clone(store.cache());
            (Arc::new(store), Some(cache))
        }
        (Some(dir), false) => (Arc::new(RedbStore::open(dir)?), None),
        (None, true) => {
            let store = CachedStore::new(MemoryStore::new());
            let cache = Arc::clone(store.cache());
            (Arc::new(store), Some(cache))
        }
        (None, false) => (Arc::new(MemoryStore::new()), None),
    })
}
