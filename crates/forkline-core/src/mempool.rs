//! Pool of unconfirmed transactions and reorg reconciliation.
//!
//! The pool tracks two sets:
//! - `unconfirmed`: transactions waiting for a block, keyed by txid
//! - `confirmed`: txids currently on the in-memory best chain, with height
//!
//! When the best chain changes, [`Mempool::affect_new_chain`] moves
//! transactions between the two and sweeps out expired, confirmed and
//! double-spending entries. Once blocks are flushed to the store their txids
//! are dropped from `confirmed` by [`Mempool::release_flushed`].
//!
//! Structural and signature checks are the caller's job.

use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::MempoolError;
use crate::traits::SpendIndex;
use crate::types::{Block, Hash256, Transaction, TxType};

/// Capacity of the event channel.
const EVENT_CAPACITY: usize = 1024;

/// Notifications published by the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MempoolEvent {
    /// A transaction entered the pool and is not yet on the best chain.
    NewUnconfirmed(Hash256),
}

/// Why a transaction left the pool during a sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Expired,
    Confirmed,
    InputSpent,
}

/// Types that only ever appear inside blocks and never enter the pool.
fn is_block_only(tx_type: TxType) -> bool {
    tx_type.is_reward() || tx_type == TxType::Genesis
}

/// In-memory pool of unconfirmed transactions.
///
/// Not thread-safe. The fork manager wraps it in a `Mutex` and always takes
/// that lock after its own.
pub struct Mempool {
    unconfirmed: HashMap<Hash256, Transaction>,
    confirmed: HashMap<Hash256, u32>,
    booting: bool,
    events: broadcast::Sender<MempoolEvent>,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            unconfirmed: HashMap::new(),
            confirmed: HashMap::new(),
            booting: false,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MempoolEvent> {
        self.events.subscribe()
    }

    /// While booting, reorgs move transactions but never sweep.
    pub fn set_booting(&mut self, booting: bool) {
        self.booting = booting;
    }

    pub fn is_booting(&self) -> bool {
        self.booting
    }

    /// Add an unconfirmed transaction.
    ///
    /// Returns `Ok(false)` for reward transactions and for txids already in
    /// the pool. The `NewUnconfirmed` event is skipped when the txid is
    /// already on the best chain. A transaction that cannot be encoded fails
    /// with [`MempoolError::Format`].
    pub fn put_unconfirmed(&mut self, tx: Transaction) -> Result<bool, MempoolError> {
        if let Some(height) = tx.height {
            return Err(MempoolError::AlreadyConfirmed(height));
        }
        if is_block_only(tx.tx_type) {
            return Ok(false);
        }
        let txid = tx.txid()?;
        if self.unconfirmed.contains_key(&txid) {
            return Ok(false);
        }
        self.unconfirmed.insert(txid, tx);
        if !self.confirmed.contains_key(&txid) {
            let _ = self.events.send(MempoolEvent::NewUnconfirmed(txid));
        }
        debug!(%txid, "unconfirmed transaction added");
        Ok(true)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.unconfirmed.get(txid)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.unconfirmed.contains_key(txid)
    }

    /// Height of a txid on the in-memory best chain.
    pub fn confirmed_height(&self, txid: &Hash256) -> Option<u32> {
        self.confirmed.get(txid).copied()
    }

    pub fn len(&self) -> usize {
        self.unconfirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unconfirmed.is_empty()
    }

    pub fn confirmed_len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn txids(&self) -> impl Iterator<Item = &Hash256> {
        self.unconfirmed.keys()
    }

    /// Reconcile the pool with a best-chain switch.
    ///
    /// `now` is seconds since genesis. Transactions of `removed` blocks go
    /// back to the pool, those of `added` blocks become confirmed, and then
    /// (unless booting) the pool is swept. Never fails; lookup errors are
    /// logged and the entry is kept.
    pub fn affect_new_chain<S: SpendIndex + ?Sized>(
        &mut self,
        removed: &[&Block],
        added: &[&Block],
        spends: &S,
        now: u64,
    ) {
        for block in removed {
            for tx in &block.transactions {
                if is_block_only(tx.tx_type) {
                    continue;
                }
                let Ok(txid) = tx.txid() else { continue };
                self.confirmed.remove(&txid);
                let mut tx = tx.clone();
                tx.height = None;
                self.unconfirmed.insert(txid, tx);
            }
        }
        for block in added {
            for tx in &block.transactions {
                if is_block_only(tx.tx_type) {
                    continue;
                }
                let Ok(txid) = tx.txid() else { continue };
                self.unconfirmed.remove(&txid);
                self.confirmed.insert(txid, block.height);
            }
        }
        if self.booting {
            return;
        }
        let dropped = self.sweep(spends, now);
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "mempool sweep dropped transactions");
        }
    }

    fn sweep<S: SpendIndex + ?Sized>(&mut self, spends: &S, now: u64) -> Vec<(Hash256, DropReason)> {
        let mut dropped = Vec::new();
        for (txid, tx) in &self.unconfirmed {
            if u64::from(tx.deadline) < now {
                dropped.push((*txid, DropReason::Expired));
            } else if self.confirmed.contains_key(txid) {
                dropped.push((*txid, DropReason::Confirmed));
            } else {
                for input in &tx.inputs {
                    match spends.is_spent(&input.previous_hash, input.index) {
                        Ok(true) => {
                            dropped.push((*txid, DropReason::InputSpent));
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => warn!(%txid, "spend lookup failed during sweep: {e}"),
                    }
                }
            }
        }
        for (txid, _) in &dropped {
            self.unconfirmed.remove(txid);
        }
        dropped
    }

    /// Record the transactions of `blocks` as confirmed without touching
    /// the unconfirmed set or sweeping. Used when a restored best chain is
    /// handed to a fresh pool.
    pub fn track_confirmed<'a>(&mut self, blocks: impl IntoIterator<Item = &'a Block>) {
        for block in blocks {
            for tx in &block.transactions {
                if is_block_only(tx.tx_type) {
                    continue;
                }
                if let Ok(txid) = tx.txid() {
                    self.confirmed.insert(txid, block.height);
                }
            }
        }
    }

    /// Forget flushed blocks' txids from the confirmed set.
    pub fn release_flushed<'a>(&mut self, blocks: impl IntoIterator<Item = &'a Block>) {
        for block in blocks {
            for tx in &block.transactions {
                if let Ok(txid) = tx.txid() {
                    self.confirmed.remove(&txid);
                }
            }
        }
    }
}
