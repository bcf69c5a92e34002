//! Trait interfaces between the ledger core and its storage.
//!
//! - [`BlockIndex`]: ancestor lookups for the difficulty oracle (forkline-node implements)
//! - [`SpendIndex`]: persistent used-output lookups for the mempool sweep

use std::collections::HashMap;

use crate::error::ForklineError;
use crate::types::{Block, Consensus, Hash256};

/// The header fields the difficulty oracle needs from an ancestor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AncestorInfo {
    pub previous_hash: Hash256,
    pub consensus: Consensus,
    pub bits: u32,
    pub time: u32,
}

impl From<&Block> for AncestorInfo {
    fn from(block: &Block) -> Self {
        Self {
            previous_hash: block.header.previous_hash,
            consensus: block.consensus,
            bits: block.header.bits,
            time: block.header.time,
        }
    }
}

/// Block lookup by hash across memory and persistent storage.
pub trait BlockIndex: Send + Sync {
    /// `None` when the hash is unknown.
    fn ancestor(&self, hash: &Hash256) -> Result<Option<AncestorInfo>, ForklineError>;
}

/// Whether an output has already been consumed by a persisted transaction.
pub trait SpendIndex {
    fn is_spent(&self, txid: &Hash256, index: u8) -> Result<bool, ForklineError>;
}

/// In-memory [`BlockIndex`] keyed by block hash. Suitable for testing.
#[derive(Default, Debug, Clone)]
pub struct MemoryBlockIndex {
    blocks: HashMap<Hash256, AncestorInfo>,
}

impl MemoryBlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: &Block) -> Hash256 {
        let hash = block.hash();
        self.blocks.insert(hash, AncestorInfo::from(block));
        hash
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockIndex for MemoryBlockIndex {
    fn ancestor(&self, hash: &Hash256) -> Result<Option<AncestorInfo>, ForklineError> {
        Ok(self.blocks.get(hash).copied())
    }
}

/// A [`SpendIndex`] where nothing is spent.
pub struct NoSpends;

impl SpendIndex for NoSpends {
    fn is_spent(&self, _txid: &Hash256, _index: u8) -> Result<bool, ForklineError> {
        Ok(false)
    }
}
