//! Block acceptance rules.
//!
//! - **Content** ([`check_block`]): orphan status, transaction presence, size,
//!   reward placement, merkle root, required bits and (for stake blocks) the
//!   cross-algorithm bias.
//! - **Time** ([`check_block_time`]): declared time against the local receipt
//!   time.
//!
//! The genesis block is never passed through here; the fork manager seeds it
//! directly.

use tracing::{debug, warn};

use crate::difficulty::DifficultyOracle;
use crate::error::{ForklineError, ValidationError};
use crate::merkle;
use crate::traits::BlockIndex;
use crate::types::{Block, Consensus};

/// Relative tolerance when comparing a declared bias with the recomputed one.
const BIAS_TOLERANCE: f64 = 1e-9;

/// Validate a block against the chain it extends.
///
/// `index` must resolve the block's ancestors (memory and store) so that the
/// oracle can recompute the required bits from the parent.
pub fn check_block<I: BlockIndex + ?Sized>(
    block: &Block,
    oracle: &DifficultyOracle,
    index: &I,
) -> Result<(), ForklineError> {
    let hash = block.hash();
    if block.orphan {
        return Err(ValidationError::OrphanBlock(hash.to_string()).into());
    }

    let Some(first) = block.transactions.first() else {
        return Err(ValidationError::NoTransactions.into());
    };

    let size = block.size()?;
    let max = oracle.params().max_block_size;
    if size > max {
        return Err(ValidationError::OversizedBlock { size, max }.into());
    }

    let expected = block.consensus.reward_type();
    if first.tx_type != expected {
        return Err(ValidationError::UnexpectedReward {
            got: format!("{:?}", first.tx_type),
            expected: format!("{expected:?}"),
        }
        .into());
    }

    if merkle::merkle_root(&block.txids()?) != block.header.merkle_root {
        return Err(ValidationError::InvalidMerkleRoot.into());
    }

    let (bits, _) = oracle.get_bits_by_hash(block.previous_hash(), block.consensus, index)?;
    if block.header.bits != bits {
        return Err(ValidationError::InvalidBits { got: block.header.bits, expected: bits }.into());
    }

    if block.consensus == Consensus::Stake {
        let bias = oracle.get_bias_by_hash(block.previous_hash(), block.consensus, index)?;
        if (block.bias - bias).abs() > BIAS_TOLERANCE * bias.abs().max(1.0) {
            return Err(ValidationError::InvalidBias { got: block.bias, expected: bias }.into());
        }
    }

    debug!(%hash, consensus = ?block.consensus, "block passed content checks");
    Ok(())
}

/// Validate a block's declared time against when it was received.
///
/// Rejects when `header.time` (seconds since genesis) is further than the
/// accept margin from `received_at`. The processing delay
/// `now - relay_delay - received_at` is only logged when it exceeds the
/// margin.
pub fn check_block_time(
    block: &Block,
    relay_delay: i64,
    now: u64,
    oracle: &DifficultyOracle,
) -> Result<(), ValidationError> {
    let params = oracle.params();
    let margin = params.accept_margin;
    let declared = i64::from(block.header.time);
    let estimated = params.relative_time(block.received_at) as i64;
    if (declared - estimated).unsigned_abs() > margin {
        return Err(ValidationError::TimeOutOfRange { declared, estimated, margin });
    }

    let delay = now as i64 - relay_delay - block.received_at as i64;
    if delay > margin as i64 {
        warn!(hash = %block.hash(), delay, "block accepted after a long delay");
    }
    Ok(())
}
