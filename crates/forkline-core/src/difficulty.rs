//! Multi-algorithm difficulty oracle.
//!
//! Every consensus algorithm retargets independently with a linearly weighted
//! moving average (LWMA) over its own last `N` solve times, skipping blocks
//! produced by other algorithms. Each algorithm's expected spacing `T` is the
//! chain-wide block time divided by its configured share.
//!
//! # Window sizing
//!
//! `N = floor(45 * (600 / T)^0.3)` and
//! `K = floor((N + 1) / 2 * 0.9989^(500 / N) * T)`. For `T = 600` this gives
//! `N = 45`, `K = 13632`.
//!
//! # Retarget
//!
//! With `ts` and `target` the last `N + 1` same-algorithm blocks oldest first:
//!
//! 1. `t = Σ_{i=0}^{N-1} (ts[i+1] - ts[i]) * (i + 1)` (signed, so out-of-order
//!    timestamps pull the sum down)
//! 2. `t = max(t, N * K / 3)` (at most a 3x difficulty increase per step)
//! 3. `new = t * Σ target[1..=N] / K / N / N`, clamped to `[1, MAX_TARGET]`
//!
//! # Targets and bits
//!
//! Targets are 256-bit unsigned integers (`BigUint`) carried on the wire in
//! the Bitcoin compact encoding: one exponent byte and a 23-bit mantissa.
//! Higher target = easier. [`MAX_BITS`] is the easiest permitted target and
//! is answered whenever the window cannot be filled.
//!
//! # Caching
//!
//! Answers are cached per `(previous_hash, consensus)`. Blocks are immutable,
//! so entries never go stale; the caches are only bounded in size.

use std::collections::HashMap;
use std::sync::LazyLock;

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::constants::{
    BIAS_WINDOW, ChainParams, DIFFICULTY_CACHE_LIMIT, GENESIS_PREVIOUS_HASH, MAX_ANCESTOR_WALK,
    MAX_BITS,
};
use crate::error::{ForklineError, ValidationError};
use crate::traits::BlockIndex;
use crate::types::{Consensus, Hash256};

/// Easiest permitted target, decoded from [`MAX_BITS`].
pub static MAX_TARGET: LazyLock<BigUint> = LazyLock::new(|| bits_to_target(MAX_BITS));

/// Decode compact bits into a target.
///
/// # Examples
///
/// ```
/// use forkline_core::difficulty::{bits_to_target, target_to_bits};
/// let target = bits_to_target(0x1d00_ffff);
/// assert_eq!(target_to_bits(&target), 0x1d00_ffff);
/// ```
pub fn bits_to_target(bits: u32) -> BigUint {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent as usize - 3))
    }
}

/// Encode a target as compact bits, truncating to a 23-bit mantissa.
pub fn target_to_bits(target: &BigUint) -> u32 {
    let mut size = target.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        target.to_u32().unwrap_or(0) << (8 * (3 - size))
    } else {
        let shifted: BigUint = target >> (8 * (size as usize - 3));
        shifted.to_u32().unwrap_or(0)
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// `MAX_TARGET / target` as a float. Zero targets score nothing.
pub fn difficulty_of(bits: u32) -> f64 {
    let target = bits_to_target(bits);
    match (MAX_TARGET.to_f64(), target.to_f64()) {
        (Some(max), Some(t)) if t > 0.0 => max / t,
        _ => 0.0,
    }
}

/// LWMA window length `N` and normalizer `K` for a block time `T`.
pub fn lwma_params(block_time: u64) -> (usize, u64) {
    let t = block_time.max(1) as f64;
    let n = ((45.0 * (600.0 / t).powf(0.3)) as usize).max(1);
    let adjust = 0.9989f64.powf(500.0 / n as f64);
    let k = ((n as f64 + 1.0) / 2.0 * adjust * t) as u64;
    (n, k.max(1))
}

type CacheKey = (Hash256, Consensus);

/// Size-bounded map that evicts by insertion order.
///
/// Once the limit is exceeded, the oldest entries are dropped until fewer
/// than 80% of the limit remain.
#[derive(Debug)]
struct BoundedCache<V> {
    entries: HashMap<CacheKey, (u64, V)>,
    next_seq: u64,
    limit: usize,
}

impl<V: Clone> BoundedCache<V> {
    fn new(limit: usize) -> Self {
        Self { entries: HashMap::new(), next_seq: 0, limit }
    }

    fn get(&self, key: &CacheKey) -> Option<V> {
        self.entries.get(key).map(|(_, v)| v.clone())
    }

    fn insert(&mut self, key: CacheKey, value: V) {
        self.next_seq += 1;
        self.entries.insert(key, (self.next_seq, value));
        if self.entries.len() > self.limit {
            self.evict();
        }
    }

    fn evict(&mut self) {
        let keep = (self.limit * 4 / 5).saturating_sub(1);
        let mut order: Vec<(u64, CacheKey)> =
            self.entries.iter().map(|(k, (seq, _))| (*seq, *k)).collect();
        order.sort_unstable_by_key(|(seq, _)| *seq);
        let excess = self.entries.len().saturating_sub(keep);
        for (_, key) in order.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        debug!(remaining = self.entries.len(), "difficulty cache evicted {excess} entries");
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Per-algorithm retarget and bias computation with bounded caches.
///
/// Shared by reference between validation and block production; the caches
/// are internally locked.
#[derive(Debug)]
pub struct DifficultyOracle {
    params: ChainParams,
    bits_cache: Mutex<BoundedCache<(u32, BigUint)>>,
    bias_cache: Mutex<BoundedCache<f64>>,
}

impl DifficultyOracle {
    pub fn new(params: ChainParams) -> Self {
        Self::with_cache_limit(params, DIFFICULTY_CACHE_LIMIT)
    }

    pub fn with_cache_limit(params: ChainParams, limit: usize) -> Self {
        Self {
            params,
            bits_cache: Mutex::new(BoundedCache::new(limit)),
            bias_cache: Mutex::new(BoundedCache::new(limit)),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    fn max_answer() -> (u32, BigUint) {
        (MAX_BITS, MAX_TARGET.clone())
    }

    /// Required `(bits, target)` for a `consensus` block built on `previous_hash`.
    ///
    /// Answers the maximum target when difficulty is constant, when the parent
    /// is the genesis sentinel, or when fewer than `N + 1` same-algorithm
    /// ancestors can be found.
    pub fn get_bits_by_hash<I: BlockIndex + ?Sized>(
        &self,
        previous_hash: &Hash256,
        consensus: Consensus,
        index: &I,
    ) -> Result<(u32, BigUint), ForklineError> {
        if self.params.constant_difficulty || *previous_hash == GENESIS_PREVIOUS_HASH {
            return Ok(Self::max_answer());
        }
        let block_time = self
            .params
            .block_time(consensus)
            .ok_or_else(|| ValidationError::UnconfiguredConsensus(format!("{consensus:?}")))?;
        let key = (*previous_hash, consensus);
        if let Some(hit) = self.bits_cache.lock().get(&key) {
            return Ok(hit);
        }

        let (n, k) = lwma_params(block_time);
        let mut times: Vec<i64> = Vec::with_capacity(n + 1);
        let mut targets: Vec<BigUint> = Vec::with_capacity(n + 1);
        let mut cursor = *previous_hash;
        for _ in 0..MAX_ANCESTOR_WALK {
            let Some(info) = index.ancestor(&cursor)? else {
                trace!(%cursor, "ancestor missing, using max target");
                return Ok(Self::max_answer());
            };
            if info.consensus == consensus {
                times.push(i64::from(info.time));
                targets.push(bits_to_target(info.bits));
                if times.len() == n + 1 {
                    break;
                }
            }
            cursor = info.previous_hash;
            if cursor == GENESIS_PREVIOUS_HASH {
                return Ok(Self::max_answer());
            }
        }
        if times.len() < n + 1 {
            debug!(%previous_hash, ?consensus, "retarget walk exceeded bound");
            return Ok(Self::max_answer());
        }
        times.reverse();
        targets.reverse();

        let mut weighted: i64 = 0;
        let mut sum_target = BigUint::zero();
        for i in 0..n {
            weighted += (times[i + 1] - times[i]) * (i as i64 + 1);
            sum_target += &targets[i + 1];
        }
        let floor = (n as i64) * (k as i64) / 3;
        let weighted = weighted.max(floor) as u64;

        let mut new_target = BigUint::from(weighted) * sum_target / k / ((n * n) as u64);
        if new_target > *MAX_TARGET {
            new_target = MAX_TARGET.clone();
        } else if new_target.is_zero() {
            new_target = BigUint::from(1u8);
        }
        let bits = target_to_bits(&new_target);
        trace!(%previous_hash, ?consensus, bits = format_args!("{bits:#010x}"), "retarget");
        self.bits_cache.lock().insert(key, (bits, new_target.clone()));
        Ok((bits, new_target))
    }

    /// Ratio of recency-weighted base-algorithm targets to `consensus` targets.
    ///
    /// 1.0 for the base algorithm, for genesis, and whenever either window of
    /// [`BIAS_WINDOW`] blocks cannot be filled.
    pub fn get_bias_by_hash<I: BlockIndex + ?Sized>(
        &self,
        previous_hash: &Hash256,
        consensus: Consensus,
        index: &I,
    ) -> Result<f64, ForklineError> {
        let base = self.params.base_consensus;
        if consensus == base || consensus == Consensus::Genesis {
            return Ok(1.0);
        }
        if *previous_hash == GENESIS_PREVIOUS_HASH {
            return Ok(1.0);
        }
        let key = (*previous_hash, consensus);
        if let Some(hit) = self.bias_cache.lock().get(&key) {
            return Ok(hit);
        }

        let mut sum_base = BigUint::zero();
        let mut sum_target = BigUint::zero();
        let (mut base_count, mut target_count) = (0usize, 0usize);
        let mut cursor = *previous_hash;
        let mut complete = false;
        for _ in 0..MAX_ANCESTOR_WALK {
            let Some(info) = index.ancestor(&cursor)? else {
                return Ok(1.0);
            };
            cursor = info.previous_hash;
            if cursor == GENESIS_PREVIOUS_HASH {
                return Ok(1.0);
            }
            if info.consensus == base && base_count < BIAS_WINDOW {
                sum_base += bits_to_target(info.bits) * (BIAS_WINDOW - base_count) as u64;
                base_count += 1;
            } else if info.consensus == consensus && target_count < BIAS_WINDOW {
                sum_target += bits_to_target(info.bits) * (BIAS_WINDOW - target_count) as u64;
                target_count += 1;
            }
            if base_count == BIAS_WINDOW && target_count == BIAS_WINDOW {
                complete = true;
                break;
            }
        }
        if !complete {
            return Ok(1.0);
        }

        let bias = match (sum_base.to_f64(), sum_target.to_f64()) {
            (Some(b), Some(t)) if t > 0.0 => b / t,
            _ => 1.0,
        };
        self.bias_cache.lock().insert(key, bias);
        Ok(bias)
    }

    /// Number of cached `(bits, bias)` answers.
    pub fn cache_len(&self) -> (usize, usize) {
        (self.bits_cache.lock().len(), self.bias_cache.lock().len())
    }

    pub fn clear_cache(&self) {
        self.bits_cache.lock().clear();
        self.bias_cache.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MemoryBlockIndex;
    use crate::types::{Block, BlockHeader};

    const X: u32 = 0x1d00_ffff;

    fn params() -> ChainParams {
        ChainParams {
            consensus_shares: vec![
                (Consensus::Yespower, 100),
                (Consensus::X11, 100),
                (Consensus::Stake, 100),
            ],
            ..ChainParams::default()
        }
    }

    fn block(prev: Hash256, consensus: Consensus, bits: u32, time: u32, nonce: u32) -> Block {
        let header = BlockHeader {
            version: 1,
            previous_hash: prev,
            merkle_root: Hash256::ZERO,
            time,
            bits,
            nonce,
        };
        Block::new(header, consensus, Vec::new())
    }

    /// Genesis followed by `layout` blocks; returns the index and the tip hash.
    fn chain(layout: &[(Consensus, u32, u32)]) -> (MemoryBlockIndex, Hash256) {
        let mut index = MemoryBlockIndex::new();
        let mut tip = index.insert(&block(GENESIS_PREVIOUS_HASH, Consensus::Genesis, MAX_BITS, 0, 0));
        for (i, (consensus, bits, time)) in layout.iter().enumerate() {
            tip = index.insert(&block(tip, *consensus, *bits, *time, i as u32 + 1));
        }
        (index, tip)
    }

    fn steady(consensus: Consensus, count: u32, spacing: u32) -> Vec<(Consensus, u32, u32)> {
        (1..=count).map(|i| (consensus, X, i * spacing)).collect()
    }

    fn ratio(a: &BigUint, b: &BigUint) -> f64 {
        a.to_f64().unwrap() / b.to_f64().unwrap()
    }

    #[test]
    fn max_bits_round_trip() {
        assert_eq!(target_to_bits(&MAX_TARGET), MAX_BITS);
        assert_eq!(target_to_bits(&bits_to_target(X)), X);
    }

    #[test]
    fn small_targets_encode() {
        assert_eq!(target_to_bits(&BigUint::from(0x12u32)), 0x0112_0000);
        assert_eq!(bits_to_target(0x0112_0000), BigUint::from(0x12u32));
        // High mantissa bit forces one more exponent byte.
        assert_eq!(target_to_bits(&BigUint::from(0x80u32)), 0x0200_8000);
    }

    #[test]
    fn lwma_params_at_600() {
        assert_eq!(lwma_params(600), (45, 13632));
    }

    #[test]
    fn lwma_window_grows_for_faster_chains() {
        let (n_fast, _) = lwma_params(120);
        let (n_slow, _) = lwma_params(2400);
        assert!(n_fast > 45);
        assert!(n_slow < 45);
    }

    #[test]
    fn genesis_previous_is_max_for_every_consensus() {
        let oracle = DifficultyOracle::new(params());
        let index = MemoryBlockIndex::new();
        for c in [Consensus::Stake, Consensus::Yespower, Consensus::X11] {
            let (bits, target) = oracle.get_bits_by_hash(&GENESIS_PREVIOUS_HASH, c, &index).unwrap();
            assert_eq!(bits, MAX_BITS);
            assert_eq!(target, *MAX_TARGET);
        }
    }

    #[test]
    fn constant_difficulty_short_circuits() {
        let oracle = DifficultyOracle::new(ChainParams { constant_difficulty: true, ..params() });
        let (index, tip) = chain(&steady(Consensus::Yespower, 60, 600));
        let (bits, _) = oracle.get_bits_by_hash(&tip, Consensus::Yespower, &index).unwrap();
        assert_eq!(bits, MAX_BITS);
    }

    #[test]
    fn short_chain_is_max() {
        let oracle = DifficultyOracle::new(params());
        let (index, tip) = chain(&steady(Consensus::Yespower, 45, 600));
        let (bits, _) = oracle.get_bits_by_hash(&tip, Consensus::Yespower, &index).unwrap();
        assert_eq!(bits, MAX_BITS);
    }

    #[test]
    fn unknown_parent_is_max() {
        let oracle = DifficultyOracle::new(params());
        let index = MemoryBlockIndex::new();
        let (bits, _) = oracle.get_bits_by_hash(&Hash256([1; 32]), Consensus::X11, &index).unwrap();
        assert_eq!(bits, MAX_BITS);
    }

    #[test]
    fn unconfigured_consensus_is_error() {
        let oracle = DifficultyOracle::new(params());
        let (index, tip) = chain(&steady(Consensus::Yespower, 3, 600));
        let err = oracle.get_bits_by_hash(&tip, Consensus::X16s, &index).unwrap_err();
        assert!(matches!(err, ForklineError::Validation(ValidationError::UnconfiguredConsensus(_))));
    }

    #[test]
    fn steady_spacing_keeps_target() {
        let oracle = DifficultyOracle::new(params());
        let (index, tip) = chain(&steady(Consensus::Yespower, 60, 600));
        let (bits, target) = oracle.get_bits_by_hash(&tip, Consensus::Yespower, &index).unwrap();
        let r = ratio(&target, &bits_to_target(X));
        assert!((0.98..=1.02).contains(&r), "ratio {r}");
        assert_eq!(bits, target_to_bits(&target));
    }

    #[test]
    fn fast_blocks_clamp_to_three_times_harder() {
        let oracle = DifficultyOracle::new(params());
        let (index, tip) = chain(&steady(Consensus::Yespower, 60, 60));
        let (_, target) = oracle.get_bits_by_hash(&tip, Consensus::Yespower, &index).unwrap();
        let r = ratio(&target, &bits_to_target(X));
        assert!((r - 1.0 / 3.0).abs() < 0.01, "ratio {r}");
    }

    #[test]
    fn slow_blocks_ease_target() {
        let oracle = DifficultyOracle::new(params());
        let (index, tip) = chain(&steady(Consensus::Yespower, 60, 1200));
        let (_, target) = oracle.get_bits_by_hash(&tip, Consensus::Yespower, &index).unwrap();
        assert!(ratio(&target, &bits_to_target(X)) > 1.9);
    }

    #[test]
    fn other_algorithms_are_skipped() {
        let oracle = DifficultyOracle::new(params());
        let mut layout = Vec::new();
        for i in 1..=60u32 {
            layout.push((Consensus::Yespower, X, i * 600));
            layout.push((Consensus::X11, 0x1c00_ffff, i * 600 + 300));
        }
        let (index, tip) = chain(&layout);
        let (_, interleaved) = oracle.get_bits_by_hash(&tip, Consensus::Yespower, &index).unwrap();
        let (index, tip) = chain(&steady(Consensus::Yespower, 60, 600));
        let (_, alone) = oracle.get_bits_by_hash(&tip, Consensus::Yespower, &index).unwrap();
        assert_eq!(interleaved, alone);
    }

    #[test]
    fn answers_are_cached() {
        let oracle = DifficultyOracle::new(params());
        let (index, tip) = chain(&steady(Consensus::Yespower, 60, 600));
        let first = oracle.get_bits_by_hash(&tip, Consensus::Yespower, &index).unwrap();
        assert_eq!(oracle.cache_len().0, 1);
        // Served from cache even with an empty index.
        let second = oracle.get_bits_by_hash(&tip, Consensus::Yespower, &MemoryBlockIndex::new()).unwrap();
        assert_eq!(first, second);
        oracle.clear_cache();
        assert_eq!(oracle.cache_len(), (0, 0));
    }

    #[test]
    fn cache_evicts_oldest_fifth() {
        let mut cache = BoundedCache::new(300);
        for i in 0..301u32 {
            let mut h = [0u8; 32];
            h[..4].copy_from_slice(&i.to_be_bytes());
            cache.insert((Hash256(h), Consensus::X11), i);
        }
        assert!(cache.len() < 240);
        let mut newest = [0u8; 32];
        newest[..4].copy_from_slice(&300u32.to_be_bytes());
        assert_eq!(cache.get(&(Hash256(newest), Consensus::X11)), Some(300));
        assert_eq!(cache.get(&(Hash256([0; 32]), Consensus::X11)), None);
    }

    #[test]
    fn bias_is_one_for_base_and_genesis() {
        let oracle = DifficultyOracle::new(params());
        let index = MemoryBlockIndex::new();
        let any = Hash256([5; 32]);
        assert_eq!(oracle.get_bias_by_hash(&any, Consensus::Yespower, &index).unwrap(), 1.0);
        assert_eq!(oracle.get_bias_by_hash(&any, Consensus::Genesis, &index).unwrap(), 1.0);
        assert_eq!(oracle.get_bias_by_hash(&GENESIS_PREVIOUS_HASH, Consensus::Stake, &index).unwrap(), 1.0);
    }

    #[test]
    fn bias_is_target_ratio() {
        let oracle = DifficultyOracle::new(params());
        let mut layout = Vec::new();
        for i in 1..=40u32 {
            layout.push((Consensus::Yespower, 0x1d00_ffff, i * 20));
            // Stake targets are twice the base targets.
            layout.push((Consensus::Stake, 0x1d01_fffe, i * 20 + 10));
        }
        let (index, tip) = chain(&layout);
        let bias = oracle.get_bias_by_hash(&tip, Consensus::Stake, &index).unwrap();
        assert!((bias - 0.5).abs() < 1e-9, "bias {bias}");
    }

    #[test]
    fn bias_short_history_is_one() {
        let oracle = DifficultyOracle::new(params());
        let mut layout = Vec::new();
        for i in 1..=10u32 {
            layout.push((Consensus::Yespower, X, i * 20));
            layout.push((Consensus::Stake, 0x1d01_fffe, i * 20 + 10));
        }
        let (index, tip) = chain(&layout);
        assert_eq!(oracle.get_bias_by_hash(&tip, Consensus::Stake, &index).unwrap(), 1.0);
    }
}
