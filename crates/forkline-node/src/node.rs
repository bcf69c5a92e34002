//! Node composition.
//!
//! The [`Node`] wires the store, snapshots, difficulty oracle, fork manager
//! and mempool together and runs every incoming block through the time and
//! content checks before it reaches the fork manager.

use std::sync::Arc;

use tracing::{debug, info};

use forkline_core::block_validation::{check_block, check_block_time};
use forkline_core::contract::{self, ContractExecutor};
use forkline_core::difficulty::DifficultyOracle;
use forkline_core::error::{ConsistencyError, ForklineError};
use forkline_core::genesis::genesis_block;
use forkline_core::types::{Block, Consensus, Hash256, Transaction};

use crate::chain::{Chain, unix_now};
use crate::config::NodeConfig;
use crate::snapshot::SnapshotStore;
use crate::storage::ChainDb;

/// Seconds a locally built conclusion stays valid.
const CONCLUDE_DEADLINE: u32 = 10_800;

/// A node: store, fork manager and mempool for one network.
pub struct Node {
    chain: Arc<Chain>,
    config: NodeConfig,
}

impl Node {
    /// Open the store under the configured data directory and recover the
    /// chain. The mempool starts in boot mode; see
    /// [`finish_initial_sync`](Self::finish_initial_sync).
    pub fn open(config: NodeConfig) -> Result<Self, ForklineError> {
        std::fs::create_dir_all(config.chain_dir()).map_err(|e| ForklineError::Storage(e.to_string()))?;
        let db = Arc::new(ChainDb::open(config.db_path(), config.sync_writes)?);
        let snapshots = SnapshotStore::new(config.snapshot_dir())?;
        let oracle = Arc::new(DifficultyOracle::new(config.params()));
        let genesis = genesis_block(config.network)?;

        let chain = Chain::open(db, snapshots, genesis, config.chain_settings()?, oracle)?;
        chain.set_booting(true);
        if let Some((tip, height)) = chain.best_tip() {
            info!(network = ?config.network, %tip, height, "node opened");
        }
        Ok(Self { chain: Arc::new(chain), config })
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Leave boot mode: later reorgs sweep the mempool.
    pub fn finish_initial_sync(&self) {
        self.chain.set_booting(false);
        info!("initial sync finished");
    }

    /// Check and track a block, then flush if the window is full.
    ///
    /// `relay_delay` is how many seconds the block spent in transit before
    /// it reached us. `received_at` is stamped with the local clock when the
    /// caller left it unset. Non-stake blocks get their bias filled in;
    /// stake blocks must declare the recomputed one. Returns `Ok(false)` for
    /// a block already known.
    pub fn accept_block(&self, mut block: Block, relay_delay: i64) -> Result<bool, ForklineError> {
        let now = unix_now();
        if block.received_at == 0 {
            block.received_at = now;
        }
        let oracle = self.chain.oracle();
        check_block_time(&block, relay_delay, now, oracle)?;
        if block.consensus != Consensus::Stake {
            block.bias = oracle.get_bias_by_hash(block.previous_hash(), block.consensus, self.chain.as_ref())?;
        }
        check_block(&block, oracle, self.chain.as_ref())?;

        let hash = block.hash();
        if !self.chain.new_block(block)? {
            debug!(%hash, "block already known");
            return Ok(false);
        }
        self.chain.batch_apply(false)?;
        Ok(true)
    }

    /// Add a transaction to the mempool. `Ok(false)` when ignored.
    pub fn accept_transaction(&self, tx: Transaction) -> Result<bool, ForklineError> {
        Ok(self.chain.mempool().put_unconfirmed(tx)?)
    }

    /// Execute the contract call started by `start_hash` and queue the
    /// resulting `ContractConclude` transaction.
    pub fn conclude_call<E: ContractExecutor + ?Sized>(
        &self,
        executor: &E,
        start_hash: &Hash256,
    ) -> Result<Transaction, ForklineError> {
        let start = self
            .chain
            .get_tx(start_hash)?
            .ok_or_else(|| ConsistencyError::MissingTx(start_hash.to_string()))?;
        let time = self.chain.params().relative_time(unix_now()) as u32;
        let tx = contract::conclude(executor, &start, time, time.saturating_add(CONCLUDE_DEADLINE))?;
        self.accept_transaction(tx.clone())?;
        Ok(tx)
    }

    /// Save a final snapshot.
    pub fn close(&self) -> Result<(), ForklineError> {
        self.chain.close()?;
        info!("node shutdown complete");
        Ok(())
    }
}
