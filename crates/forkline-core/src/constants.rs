//! Protocol constants and per-network chain parameters.

use serde::{Deserialize, Serialize};

use crate::types::{Consensus, Hash256};

/// Previous-hash of the genesis block. Never the hash of a real block.
pub const GENESIS_PREVIOUS_HASH: Hash256 = Hash256([0xff; 32]);

/// Compact encoding of the easiest permitted target.
pub const MAX_BITS: u32 = 0x1f0f_ffff;

/// Entries kept per difficulty cache before eviction kicks in.
pub const DIFFICULTY_CACHE_LIMIT: usize = 300;

/// Recency window, in blocks per algorithm, of the cross-algorithm bias.
pub const BIAS_WINDOW: usize = 30;

/// Upper bound on ancestor steps for any single oracle walk.
///
/// Interleaved algorithms mean a retarget window of `N + 1` same-algorithm
/// blocks can span many more blocks; anything longer than this is treated
/// like an unreachable ancestor.
pub const MAX_ANCESTOR_WALK: usize = 20_000;

/// Multiplier turning a block height into a positional log index.
pub const POSITION_INDEX_STRIDE: u64 = 0xffff_ffff;

/// Rotating snapshot generations kept beside the newest one.
pub const SNAPSHOT_GENERATIONS: usize = 3;

/// Default number of in-memory blocks that triggers a flush.
pub const DEFAULT_CACHE_LIMIT: usize = 300;

/// Default number of blocks written per flush.
pub const DEFAULT_BATCH_SIZE: usize = 30;

/// Length of an address in bytes.
pub const ADDRESS_LEN: usize = 40;

/// Network type: Mainnet, Testnet, or Regtest.
///
/// Selects the [`ChainParams`] a node runs with.
///
/// # Examples
///
/// ```
/// use forkline_core::constants::NetworkType;
/// let net = NetworkType::default();
/// assert_eq!(net, NetworkType::Mainnet);
/// assert!(!net.params().constant_difficulty);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network with a faster block cadence.
    Testnet,
    /// Local regression-test network, fixed maximum target.
    Regtest,
}

impl NetworkType {
    /// Subdirectory name used under the data directory.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }

    /// Chain parameters for this network.
    pub fn params(&self) -> ChainParams {
        match self {
            Self::Mainnet => ChainParams::default(),
            Self::Testnet => ChainParams {
                block_time_span: 60,
                genesis_time: 1_700_000_000,
                ..ChainParams::default()
            },
            Self::Regtest => ChainParams {
                block_time_span: 10,
                genesis_time: 1_700_000_000,
                constant_difficulty: true,
                ..ChainParams::default()
            },
        }
    }
}

/// Consensus parameters shared by the oracle, the validator and the mempool.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainParams {
    /// Target seconds between blocks across all algorithms.
    pub block_time_span: u64,
    /// Percent of blocks each algorithm is expected to produce.
    pub consensus_shares: Vec<(Consensus, u32)>,
    /// Algorithm whose targets anchor the bias ratio.
    pub base_consensus: Consensus,
    /// Unix time of the genesis block; tx and block times are relative to it.
    pub genesis_time: u64,
    /// Allowed deviation, in seconds, between declared and observed block time.
    pub accept_margin: u64,
    /// Largest encoded block accepted.
    pub max_block_size: usize,
    /// Always answer the maximum target (debug networks).
    pub constant_difficulty: bool,
    /// First address byte marking a contract address.
    pub contract_prefix: u8,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            block_time_span: 600,
            consensus_shares: vec![
                (Consensus::Stake, 40),
                (Consensus::Yespower, 30),
                (Consensus::X11, 15),
                (Consensus::X16s, 15),
            ],
            base_consensus: Consensus::Yespower,
            genesis_time: 1_600_000_000,
            accept_margin: 120,
            max_block_size: 300_000,
            constant_difficulty: false,
            contract_prefix: b'C',
        }
    }
}

impl ChainParams {
    /// Expected seconds between two blocks of `consensus`.
    ///
    /// `None` when the algorithm has no configured share.
    ///
    /// # Examples
    ///
    /// ```
    /// use forkline_core::constants::ChainParams;
    /// use forkline_core::types::Consensus;
    /// let params = ChainParams::default();
    /// assert_eq!(params.block_time(Consensus::Yespower), Some(2000));
    /// assert_eq!(params.block_time(Consensus::Genesis), None);
    /// ```
    pub fn block_time(&self, consensus: Consensus) -> Option<u64> {
        self.consensus_shares
            .iter()
            .find(|(c, share)| *c == consensus && *share > 0)
            .map(|(_, share)| (self.block_time_span as f64 / *share as f64 * 100.0).round() as u64)
    }

    /// Seconds since genesis for a unix timestamp, saturating at zero.
    pub fn relative_time(&self, unix: u64) -> u64 {
        unix.saturating_sub(self.genesis_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_time_follows_share() {
        let params = ChainParams::default();
        assert_eq!(params.block_time(Consensus::Stake), Some(1500));
        assert_eq!(params.block_time(Consensus::X11), Some(4000));
    }

    #[test]
    fn regtest_is_constant() {
        assert!(NetworkType::Regtest.params().constant_difficulty);
        assert!(!NetworkType::Testnet.params().constant_difficulty);
    }

    #[test]
    fn relative_time_saturates() {
        let params = ChainParams::default();
        assert_eq!(params.relative_time(0), 0);
        assert_eq!(params.relative_time(params.genesis_time + 5), 5);
    }
}
