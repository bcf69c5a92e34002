//! Fork manager: the in-memory block window above the last flushed block.
//!
//! Every accepted block lives in memory until it is flushed. The window may
//! hold several forks; the best chain is the path from the root with the
//! highest cumulative [`Block::score`], ties going to the lowest tip hash.
//! Once the window grows past the configured limit, the oldest best-chain
//! blocks are written to the [`ChainDb`] in one atomic batch, the root
//! advances, and everything at or below it is dropped from memory.
//!
//! Lock order: chain state, then mempool. The store batch is taken while the
//! chain state is held.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use forkline_core::constants::{ChainParams, DEFAULT_BATCH_SIZE, DEFAULT_CACHE_LIMIT, GENESIS_PREVIOUS_HASH};
use forkline_core::contract::{
    ContractConcludeMessage, ContractPayload, ContractRecord, ContractStartMessage, MintCoinMessage,
    ValidatorEditMessage, ValidatorRecord,
};
use forkline_core::difficulty::DifficultyOracle;
use forkline_core::error::{ConsistencyError, ForklineError};
use forkline_core::mempool::Mempool;
use forkline_core::traits::{AncestorInfo, BlockIndex, SpendIndex};
use forkline_core::types::{Address, Block, Hash256, Transaction, TxType};

use crate::snapshot::SnapshotStore;
use crate::storage::{AddressEntry, ChainDb, ContractHistory, position_index};

const EVENT_CAPACITY: usize = 256;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Tunables of the fork manager.
#[derive(Clone, Debug)]
pub struct ChainSettings {
    /// Flush once this many blocks are held in memory.
    pub cache_limit: usize,
    /// Most blocks written by one flush.
    pub batch_size: usize,
    /// How long a flush waits for the store batch. `None` waits forever.
    pub batch_timeout: Option<Duration>,
    /// Index every address instead of only contracts and watched addresses.
    pub full_address_index: bool,
    pub watch_addresses: HashSet<Address>,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            cache_limit: DEFAULT_CACHE_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: Some(Duration::from_secs(30)),
            full_address_index: false,
            watch_addresses: HashSet::new(),
        }
    }
}

impl ChainSettings {
    /// Whether outputs paying `address` go into the address index.
    pub fn indexes(&self, address: &Address, contract_prefix: u8) -> bool {
        self.full_address_index || address.is_contract(contract_prefix) || self.watch_addresses.contains(address)
    }
}

/// Notifications published by the fork manager.
#[derive(Clone, Debug, PartialEq)]
pub enum ChainEvent {
    /// The best tip moved. `added` and `removed` are oldest first.
    BestChainChanged { tip: Hash256, height: u32, added: Vec<Hash256>, removed: Vec<Hash256> },
    /// `count` blocks were flushed and the root is now `root` at `height`.
    Flushed { root: Hash256, height: u32, count: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Root {
    hash: Hash256,
    height: u32,
}

/// Blocks above the root. `root == None` means nothing is flushed yet and
/// the window hangs off the genesis sentinel.
#[derive(Default)]
struct ChainIndex {
    root: Option<Root>,
    blocks: HashMap<Hash256, Block>,
    /// root+1 ..= tip
    best_chain: Vec<Hash256>,
}

impl ChainIndex {
    fn root_hash(&self) -> Hash256 {
        self.root.map_or(GENESIS_PREVIOUS_HASH, |r| r.hash)
    }

    fn child_height(&self) -> u32 {
        self.root.map_or(0, |r| r.height + 1)
    }

    fn tip(&self) -> Option<(Hash256, u32)> {
        match self.best_chain.last() {
            Some(hash) => self.blocks.get(hash).map(|b| (*hash, b.height)),
            None => self.root.map(|r| (r.hash, r.height)),
        }
    }

    /// Add a block under a known parent. `Ok(None)` for duplicates.
    fn insert(&mut self, mut block: Block) -> Result<Option<Hash256>, ForklineError> {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) || self.root.is_some_and(|r| r.hash == hash) {
            return Ok(None);
        }
        let previous = *block.previous_hash();
        block.height = if previous == self.root_hash() {
            self.child_height()
        } else if let Some(parent) = self.blocks.get(&previous) {
            parent.height + 1
        } else {
            return Err(ForklineError::UnreachableAncestor(previous.to_string()));
        };
        block.orphan = true;
        block.on_memory = true;
        for tx in &mut block.transactions {
            tx.height = None;
        }
        self.blocks.insert(hash, block);
        Ok(Some(hash))
    }

    /// Hashes from root+1 up to `tip`.
    fn path_to_root(&self, tip: &Hash256) -> Result<Vec<Hash256>, ForklineError> {
        let root = self.root_hash();
        let mut path = Vec::new();
        let mut cursor = *tip;
        while cursor != root {
            let block = self
                .blocks
                .get(&cursor)
                .ok_or_else(|| ForklineError::UnreachableAncestor(cursor.to_string()))?;
            path.push(cursor);
            if path.len() > self.blocks.len() {
                return Err(ForklineError::UnreachableAncestor(tip.to_string()));
            }
            cursor = block.header.previous_hash;
        }
        path.reverse();
        Ok(path)
    }

    /// Cumulative score from the root for every connectible block.
    fn cumulative_scores(&self) -> HashMap<Hash256, f64> {
        let root = self.root_hash();
        let mut scores: HashMap<Hash256, f64> = HashMap::with_capacity(self.blocks.len());
        for start in self.blocks.keys() {
            let mut pending = Vec::new();
            let mut cursor = *start;
            let base = loop {
                if cursor == root {
                    break Some(0.0);
                }
                if let Some(score) = scores.get(&cursor) {
                    break Some(*score);
                }
                match self.blocks.get(&cursor) {
                    Some(block) if pending.len() <= self.blocks.len() => {
                        pending.push(cursor);
                        cursor = block.header.previous_hash;
                    }
                    _ => break None,
                }
            };
            let Some(mut acc) = base else { continue };
            for hash in pending.into_iter().rev() {
                acc += self.blocks.get(&hash).map_or(0.0, Block::score);
                scores.insert(hash, acc);
            }
        }
        scores
    }

    /// Tip of the highest-scoring connectible chain.
    fn find_best(&self) -> Option<Hash256> {
        self.cumulative_scores()
            .into_iter()
            .max_by(|(ha, sa), (hb, sb)| sa.total_cmp(sb).then_with(|| hb.cmp(ha)))
            .map(|(hash, _)| hash)
    }

    /// Make `best` the best chain. Returns `(removed, added)`, oldest first.
    fn switch_best(&mut self, best: Vec<Hash256>) -> (Vec<Hash256>, Vec<Hash256>) {
        let old: HashSet<Hash256> = self.best_chain.iter().copied().collect();
        let new: HashSet<Hash256> = best.iter().copied().collect();
        let removed: Vec<Hash256> = self.best_chain.iter().filter(|h| !new.contains(h)).copied().collect();
        let added: Vec<Hash256> = best.iter().filter(|h| !old.contains(h)).copied().collect();
        for hash in &removed {
            if let Some(block) = self.blocks.get_mut(hash) {
                block.orphan = true;
                for tx in &mut block.transactions {
                    tx.height = None;
                }
            }
        }
        for hash in &added {
            if let Some(block) = self.blocks.get_mut(hash) {
                block.orphan = false;
                let height = block.height;
                for tx in &mut block.transactions {
                    tx.height = Some(height);
                }
            }
        }
        self.best_chain = best;
        (removed, added)
    }

    /// Move the root forward and drop everything that no longer connects.
    fn advance_root(&mut self, root: Root) {
        self.root = Some(root);
        self.blocks.retain(|_, block| block.height > root.height);
        self.best_chain.retain(|hash| self.blocks.contains_key(hash));
        let connected = self.cumulative_scores();
        let before = self.blocks.len();
        self.blocks.retain(|hash, _| connected.contains_key(hash));
        if self.blocks.len() < before {
            debug!(pruned = before - self.blocks.len(), "dropped forks below the new root");
        }
    }

    fn best_blocks(&self) -> Vec<Block> {
        self.best_chain.iter().filter_map(|h| self.blocks.get(h).cloned()).collect()
    }

    fn find_tx(&self, txid: &Hash256) -> Option<&Transaction> {
        self.best_chain
            .iter()
            .filter_map(|h| self.blocks.get(h))
            .flat_map(|b| b.transactions.iter())
            .find(|tx| tx.txid().is_ok_and(|id| id == *txid))
    }
}

/// Spends on the persistent chain plus those on the in-memory best chain.
struct ChainSpends<'a> {
    db: &'a ChainDb,
    pending: HashSet<(Hash256, u8)>,
}

impl<'a> ChainSpends<'a> {
    fn new(db: &'a ChainDb, index: &ChainIndex) -> Self {
        let pending = index
            .best_chain
            .iter()
            .filter_map(|h| index.blocks.get(h))
            .flat_map(|b| b.transactions.iter())
            .flat_map(|tx| tx.inputs.iter().map(|i| (i.previous_hash, i.index)))
            .collect();
        Self { db, pending }
    }
}

impl SpendIndex for ChainSpends<'_> {
    fn is_spent(&self, txid: &Hash256, index: u8) -> Result<bool, ForklineError> {
        if self.pending.contains(&(*txid, index)) {
            return Ok(true);
        }
        self.db.is_spent(txid, index)
    }
}

/// Contract log record for a `ContractConclude` transaction.
fn conclude_record(
    conclude: &Transaction,
    conclude_hash: Hash256,
    start: &Transaction,
) -> Result<(Address, ContractRecord), ForklineError> {
    let msg = ContractConcludeMessage::decode(&conclude.message)?;
    let started = ContractStartMessage::decode(&start.message)?;
    let record = ContractRecord {
        start_hash: msg.start_hash,
        conclude_hash,
        payload: ContractPayload { method: started.method, args: started.args, storage_diff: msg.storage_diff },
    };
    Ok((msg.contract, record))
}

/// Cross-check every persisted height against its transactions and indexes.
fn replay(db: &ChainDb, settings: &ChainSettings, contract_prefix: u8) -> Result<Root, ForklineError> {
    let mut previous = GENESIS_PREVIOUS_HASH;
    let mut height: u32 = 0;
    while let Some(hash) = db.read_block_hash(height)? {
        let record = db.read_block_record(&hash)?.ok_or(ConsistencyError::MissingHeight(height))?;
        if record.header.previous_hash != previous {
            return Err(ConsistencyError::BrokenLink {
                height,
                previous: record.header.previous_hash.to_string(),
                expected: previous.to_string(),
            }
            .into());
        }
        if record.height != height {
            return Err(ConsistencyError::HeightMismatch { expected: height, got: record.height }.into());
        }
        for txid in &record.txids {
            let tx = db.read_tx(txid)?.ok_or_else(|| ConsistencyError::MissingTx(txid.to_string()))?;
            if tx.height != Some(height) {
                return Err(ConsistencyError::TxHeight { txid: txid.to_string(), expected: height, got: tx.height }.into());
            }
            for input in &tx.inputs {
                let prev = db
                    .read_tx(&input.previous_hash)?
                    .ok_or_else(|| ConsistencyError::MissingTx(input.previous_hash.to_string()))?;
                let output = prev.outputs.get(usize::from(input.index)).ok_or_else(|| {
                    ConsistencyError::MissingOutput { txid: input.previous_hash.to_string(), index: input.index }
                })?;
                if !db.is_spent(&input.previous_hash, input.index)? {
                    return Err(ConsistencyError::NotMarkedUsed {
                        txid: input.previous_hash.to_string(),
                        index: input.index,
                    }
                    .into());
                }
                if settings.indexes(&output.address, contract_prefix) {
                    let key = format!("{}:{}", input.previous_hash, input.index);
                    let entry = db
                        .read_address_index(&output.address, &input.previous_hash, input.index)?
                        .ok_or_else(|| ConsistencyError::MissingIndex(key.clone()))?;
                    if entry.coin_id != output.coin_id || entry.amount != output.amount || !entry.spent {
                        return Err(ConsistencyError::IndexMismatch(key).into());
                    }
                }
            }
            for (index, output) in tx.outputs.iter().enumerate() {
                if !settings.indexes(&output.address, contract_prefix) {
                    continue;
                }
                let key = format!("{txid}:{index}");
                let entry = db
                    .read_address_index(&output.address, txid, index as u8)?
                    .ok_or_else(|| ConsistencyError::MissingIndex(key.clone()))?;
                if entry.coin_id != output.coin_id || entry.amount != output.amount {
                    return Err(ConsistencyError::IndexMismatch(key).into());
                }
            }
        }
        previous = hash;
        height += 1;
    }
    info!(height = height - 1, tip = %previous, "persisted chain replayed");
    Ok(Root { hash: previous, height: height - 1 })
}

/// Rebuild the window from the newest usable snapshot generation.
fn load_snapshot(snapshots: &SnapshotStore, index: &mut ChainIndex, genesis_hash: &Hash256) -> Result<usize, ForklineError> {
    snapshots.check_failmark()?;
    for generation in snapshots.generations() {
        let blocks = match snapshots.read(generation) {
            Ok(Some(blocks)) => blocks,
            Ok(None) => continue,
            Err(e) => {
                warn!(generation, "skipping unreadable snapshot: {e}");
                continue;
            }
        };
        let first_height = index.child_height();
        let mut expected = index.root_hash();
        let mut chained = Vec::new();
        for block in blocks.into_iter().filter(|b| b.height >= first_height) {
            let hash = block.hash();
            if *block.previous_hash() != expected || (expected == GENESIS_PREVIOUS_HASH && hash != *genesis_hash) {
                break;
            }
            expected = hash;
            chained.push(block);
        }
        if chained.is_empty() {
            warn!(generation, "snapshot does not extend the persisted chain");
            continue;
        }
        let count = chained.len();
        for block in chained {
            index.insert(block)?;
        }
        info!(generation, blocks = count, "fork window restored from snapshot");
        return Ok(count);
    }
    Ok(0)
}

/// Lazily decoded contract conclusions: persisted entries, then those on
/// the in-memory best chain.
pub struct Conclusions {
    stored: ContractHistory,
    pending: std::vec::IntoIter<ContractRecord>,
    stop_at: Option<Hash256>,
    stopped: bool,
}

impl Iterator for Conclusions {
    type Item = Result<ContractRecord, ForklineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        let next = match self.stored.next() {
            Some(item) => item.map(|(_, record)| record),
            None => Ok(self.pending.next()?),
        };
        if let Ok(record) = &next {
            if Some(record.start_hash) == self.stop_at {
                self.stopped = true;
                return None;
            }
        }
        Some(next)
    }
}

/// The fork manager.
pub struct Chain {
    state: Mutex<ChainIndex>,
    db: Arc<ChainDb>,
    snapshots: SnapshotStore,
    genesis_hash: Hash256,
    settings: ChainSettings,
    mempool: Mutex<Mempool>,
    oracle: Arc<DifficultyOracle>,
    events: broadcast::Sender<ChainEvent>,
}

impl Chain {
    /// Recover the chain from `db` and `snapshots`.
    ///
    /// An empty store starts from `genesis` held in memory. Otherwise every
    /// persisted height is replayed and checked, then the newest snapshot
    /// that extends the persisted tip refills the window.
    pub fn open(
        db: Arc<ChainDb>,
        snapshots: SnapshotStore,
        genesis: Block,
        settings: ChainSettings,
        oracle: Arc<DifficultyOracle>,
    ) -> Result<Self, ForklineError> {
        let genesis_hash = genesis.hash();
        let mut index = ChainIndex::default();
        match db.read_block_hash(0)? {
            None => {
                info!(%genesis_hash, "empty store, starting from genesis");
                index.insert(genesis)?;
            }
            Some(stored) if stored != genesis_hash => {
                return Err(ConsistencyError::GenesisMismatch {
                    stored: stored.to_string(),
                    expected: genesis_hash.to_string(),
                }
                .into());
            }
            Some(_) => {
                index.root = Some(replay(&db, &settings, oracle.params().contract_prefix)?);
            }
        }

        load_snapshot(&snapshots, &mut index, &genesis_hash)?;
        if let Some(tip) = index.find_best() {
            let best = index.path_to_root(&tip)?;
            index.switch_best(best);
        }

        let mut mempool = Mempool::new();
        mempool.track_confirmed(index.best_chain.iter().filter_map(|h| index.blocks.get(h)));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            state: Mutex::new(index),
            db,
            snapshots,
            genesis_hash,
            settings,
            mempool: Mutex::new(mempool),
            oracle,
            events,
        })
    }

    pub fn params(&self) -> &ChainParams {
        self.oracle.params()
    }

    pub fn oracle(&self) -> &Arc<DifficultyOracle> {
        &self.oracle
    }

    pub fn db(&self) -> &Arc<ChainDb> {
        &self.db
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn mempool(&self) -> MutexGuard<'_, Mempool> {
        self.mempool.lock()
    }

    /// While booting the mempool moves transactions on reorgs but never sweeps.
    pub fn set_booting(&self, booting: bool) {
        self.mempool.lock().set_booting(booting);
    }

    /// Last flushed block, `None` before anything was flushed.
    pub fn root(&self) -> Option<(Hash256, u32)> {
        self.state.lock().root.map(|r| (r.hash, r.height))
    }

    /// Best tip and its height.
    pub fn best_tip(&self) -> Option<(Hash256, u32)> {
        self.state.lock().tip()
    }

    /// Blocks held in memory, across every fork.
    pub fn memory_len(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Track a block whose parent is the root or already in memory.
    ///
    /// Returns `Ok(false)` for a duplicate. Recomputes the best chain and,
    /// when the tip moves, flips orphan flags and tx heights, reconciles the
    /// mempool and publishes [`ChainEvent::BestChainChanged`].
    pub fn new_block(&self, block: Block) -> Result<bool, ForklineError> {
        if *block.previous_hash() == GENESIS_PREVIOUS_HASH && block.hash() != self.genesis_hash {
            return Err(ConsistencyError::GenesisMismatch {
                stored: block.hash().to_string(),
                expected: self.genesis_hash.to_string(),
            }
            .into());
        }

        let mut state = self.state.lock();
        let Some(hash) = state.insert(block)? else {
            return Ok(false);
        };
        let Some(best_tip) = state.find_best() else {
            return Ok(true);
        };
        let best = state.path_to_root(&best_tip)?;
        if best == state.best_chain {
            debug!(%hash, "block stored off the best chain");
            return Ok(true);
        }
        let (removed, added) = state.switch_best(best);

        let index: &ChainIndex = &state;
        let removed_blocks: Vec<&Block> = removed.iter().filter_map(|h| index.blocks.get(h)).collect();
        let added_blocks: Vec<&Block> = added.iter().filter_map(|h| index.blocks.get(h)).collect();
        let spends = ChainSpends::new(&self.db, index);
        let now = self.params().relative_time(unix_now());
        self.mempool.lock().affect_new_chain(&removed_blocks, &added_blocks, &spends, now);

        let (tip, height) = index.tip().unwrap_or((hash, 0));
        if removed.is_empty() {
            debug!(%tip, height, "best chain extended");
        } else {
            info!(%tip, height, depth = removed.len(), "best chain reorganized");
        }
        let _ = self.events.send(ChainEvent::BestChainChanged { tip, height, added, removed });
        Ok(true)
    }

    /// Flush the oldest best-chain blocks once the window is over its limit,
    /// or whenever `force` is set.
    ///
    /// All-or-nothing: on any error the batch is rolled back, the window is
    /// untouched and the error is returned. Returns the flushed blocks.
    pub fn batch_apply(&self, force: bool) -> Result<Vec<Block>, ForklineError> {
        let mut state = self.state.lock();
        if !force && state.blocks.len() < self.settings.cache_limit {
            return Ok(Vec::new());
        }
        let take = state.best_chain.len().min(self.settings.batch_size);
        if take == 0 {
            return Ok(Vec::new());
        }
        let flushing = state.best_chain[..take]
            .iter()
            .map(|h| state.blocks.get(h).cloned().ok_or_else(|| ForklineError::UnreachableAncestor(h.to_string())))
            .collect::<Result<Vec<Block>, _>>()?;
        let root = flushing
            .last()
            .map(|b| Root { hash: b.hash(), height: b.height })
            .ok_or_else(|| ForklineError::Batch("nothing to flush".into()))?;

        let batch = self.db.begin_batch(self.settings.batch_timeout)?;
        for block in &flushing {
            if let Err(e) = self.stage_block(block) {
                warn!(hash = %block.hash(), height = block.height, "flush rejected, rolling back: {e}");
                batch.rollback();
                return Err(e);
            }
        }
        let entries = batch.commit()?;

        state.advance_root(root);
        self.mempool.lock().release_flushed(flushing.iter());
        if let Err(e) = self.snapshots.save(&state.best_blocks()) {
            error!("snapshot save failed after flush: {e}");
        }
        info!(root = %root.hash, height = root.height, blocks = flushing.len(), entries, "flushed blocks");
        let _ = self.events.send(ChainEvent::Flushed { root: root.hash, height: root.height, count: flushing.len() });
        Ok(flushing)
    }

    /// Stage one block and every side effect of its transactions.
    fn stage_block(&self, block: &Block) -> Result<(), ForklineError> {
        let prefix = self.params().contract_prefix;
        self.db.write_block(block)?;
        for (position, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid()?;
            if tx.height != Some(block.height) {
                return Err(ConsistencyError::TxHeight { txid: txid.to_string(), expected: block.height, got: tx.height }.into());
            }
            self.db.write_tx(tx)?;

            for input in &tx.inputs {
                self.db.mark_used(&input.previous_hash, input.index)?;
                let prev = self
                    .db
                    .read_tx(&input.previous_hash)?
                    .ok_or_else(|| ConsistencyError::MissingTx(input.previous_hash.to_string()))?;
                let output = prev.outputs.get(usize::from(input.index)).ok_or_else(|| {
                    ConsistencyError::MissingOutput { txid: input.previous_hash.to_string(), index: input.index }
                })?;
                if self.settings.indexes(&output.address, prefix) {
                    let entry = AddressEntry { coin_id: output.coin_id, amount: output.amount, spent: true };
                    self.db.write_address_index(&output.address, &input.previous_hash, input.index, entry)?;
                }
            }
            for (index, output) in tx.outputs.iter().enumerate() {
                if self.settings.indexes(&output.address, prefix) {
                    let entry = AddressEntry { coin_id: output.coin_id, amount: output.amount, spent: false };
                    self.db.write_address_index(&output.address, &txid, index as u8, entry)?;
                }
            }

            match tx.tx_type {
                TxType::Genesis
                | TxType::PowReward
                | TxType::PosReward
                | TxType::Transfer
                | TxType::ContractStart
                | TxType::Inner => {}
                TxType::MintCoin => {
                    let msg = MintCoinMessage::decode(&tx.message)?;
                    self.db.write_coins(&txid, &msg)?;
                }
                TxType::ValidatorEdit => {
                    let msg = ValidatorEditMessage::decode(&tx.message)?;
                    let record = ValidatorRecord {
                        new_address: msg.new_address,
                        flag: msg.flag,
                        txid,
                        sig_diff: msg.sig_diff,
                    };
                    self.db.write_validator(&msg.validator, position_index(block.height, position), &record)?;
                }
                TxType::ContractConclude => {
                    let start_hash = ContractConcludeMessage::decode(&tx.message)?.start_hash;
                    let start = self
                        .db
                        .read_tx(&start_hash)?
                        .ok_or_else(|| ConsistencyError::MissingTx(start_hash.to_string()))?;
                    let start_height = start.height.ok_or_else(|| ConsistencyError::TxHeight {
                        txid: start_hash.to_string(),
                        expected: block.height,
                        got: None,
                    })?;
                    let index = self.db.tx_position_index(start_height, &start_hash)?;
                    let (contract, record) = conclude_record(tx, txid, &start)?;
                    self.db.write_contract(&contract, index, &record)?;
                }
            }
        }
        Ok(())
    }

    /// Path from the root to `tip` (oldest first), or to the best connectible
    /// tip found by a full rescan when `tip` is `None`.
    pub fn get_best_chain(&self, tip: Option<&Hash256>) -> Result<Vec<Block>, ForklineError> {
        let state = self.state.lock();
        let tip = match tip {
            Some(tip) => *tip,
            None => match state.find_best() {
                Some(tip) => tip,
                None => return Ok(Vec::new()),
            },
        };
        let path = state.path_to_root(&tip)?;
        Ok(path.iter().filter_map(|h| state.blocks.get(h).cloned()).collect())
    }

    /// A block from memory or the store.
    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ForklineError> {
        if let Some(block) = self.state.lock().blocks.get(hash) {
            return Ok(Some(block.clone()));
        }
        self.db.read_block(hash)
    }

    /// Hash of the best-chain block at `height`.
    pub fn get_block_hash(&self, height: u32) -> Result<Option<Hash256>, ForklineError> {
        {
            let state = self.state.lock();
            let first = state.child_height();
            if height >= first {
                return Ok(state.best_chain.get((height - first) as usize).copied());
            }
        }
        self.db.read_block_hash(height)
    }

    /// A transaction from the mempool, the in-memory best chain, or the store.
    pub fn get_tx(&self, txid: &Hash256) -> Result<Option<Transaction>, ForklineError> {
        {
            let state = self.state.lock();
            if let Some(tx) = self.mempool.lock().get(txid) {
                return Ok(Some(tx.clone()));
            }
            if let Some(tx) = state.find_tx(txid) {
                return Ok(Some(tx.clone()));
            }
        }
        self.db.read_tx(txid)
    }

    /// Conclusions of `contract`, oldest first, ending before the one whose
    /// start hash is `stop_at`.
    pub fn conclusions(&self, contract: &Address, stop_at: Option<Hash256>) -> Result<Conclusions, ForklineError> {
        let stored = self.db.contract_history(contract, 0)?;
        let mut pending = Vec::new();
        {
            let state = self.state.lock();
            for block in state.best_chain.iter().filter_map(|h| state.blocks.get(h)) {
                for tx in block.transactions.iter().filter(|tx| tx.tx_type == TxType::ContractConclude) {
                    let msg = ContractConcludeMessage::decode(&tx.message)?;
                    if msg.contract != *contract {
                        continue;
                    }
                    let start = match state.find_tx(&msg.start_hash) {
                        Some(start) => start.clone(),
                        None => self
                            .db
                            .read_tx(&msg.start_hash)?
                            .ok_or_else(|| ConsistencyError::MissingTx(msg.start_hash.to_string()))?,
                    };
                    pending.push(conclude_record(tx, tx.txid()?, &start)?.1);
                }
            }
        }
        Ok(Conclusions { stored, pending: pending.into_iter(), stop_at, stopped: false })
    }

    /// The conclusion of the call started by `start_hash`, if any.
    pub fn conclusion_by_start(
        &self,
        contract: &Address,
        start_hash: &Hash256,
    ) -> Result<Option<ContractRecord>, ForklineError> {
        for record in self.conclusions(contract, None)? {
            let record = record?;
            if record.start_hash == *start_hash {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Flag the newest snapshot as unusable; the next start discards it.
    pub fn mark_snapshot_failed(&self, reason: &str) -> Result<(), ForklineError> {
        warn!(reason, "marking snapshot as failed");
        self.snapshots.make_failmark(reason)
    }

    /// Persist a final snapshot of the window.
    pub fn close(&self) -> Result<(), ForklineError> {
        let state = self.state.lock();
        let blocks = state.best_blocks();
        self.snapshots.save(&blocks)?;
        info!(blocks = blocks.len(), "chain closed");
        Ok(())
    }
}

impl BlockIndex for Chain {
    fn ancestor(&self, hash: &Hash256) -> Result<Option<AncestorInfo>, ForklineError> {
        let in_memory = self.state.lock().blocks.get(hash).map(AncestorInfo::from);
        if in_memory.is_some() {
            return Ok(in_memory);
        }
        Ok(self.db.read_block_record(hash)?.map(|record| AncestorInfo {
            previous_hash: record.header.previous_hash,
            consensus: record.consensus,
            bits: record.header.bits,
            time: record.header.time,
        }))
    }
}
