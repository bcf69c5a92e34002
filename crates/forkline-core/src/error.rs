//! Error types for the Forkline ledger.
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("truncated: need {needed} bytes, {available} available")] Truncated { needed: usize, available: usize },
    #[error("length mismatch: decoded {expected} bytes, buffer has {actual}")] LengthMismatch { expected: usize, actual: usize },
    #[error("too many inputs: {0}")] TooManyInputs(usize),
    #[error("too many outputs: {0}")] TooManyOutputs(usize),
    #[error("message too large: {0}")] MessageTooLarge(usize),
    #[error("unknown tx type: {0}")] UnknownTxType(u32),
    #[error("unknown message type: {0}")] UnknownMessageType(u8),
    #[error("unknown consensus: {0}")] UnknownConsensus(u8),
    #[error("invalid address: {0}")] InvalidAddress(String),
    #[error("transaction {0} has no height")] MissingHeight(String),
    #[error("signature blob length {0} is not a multiple of 96")] SignatureBlob(usize),
    #[error("payload: {0}")] Payload(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("block {0} is orphaned")] OrphanBlock(String),
    #[error("block has no transactions")] NoTransactions,
    #[error("oversized: {size} > {max}")] OversizedBlock { size: usize, max: usize },
    #[error("first transaction is {got:?}, expected {expected:?}")] UnexpectedReward { got: String, expected: String },
    #[error("invalid merkle root")] InvalidMerkleRoot,
    #[error("invalid bits: got {got:#010x}, expected {expected:#010x}")] InvalidBits { got: u32, expected: u32 },
    #[error("invalid bias: got {got}, expected {expected}")] InvalidBias { got: f64, expected: f64 },
    #[error("block time {declared} deviates from {estimated} by more than {margin}s")] TimeOutOfRange { declared: i64, estimated: i64, margin: u64 },
    #[error("no block time configured for {0}")] UnconfiguredConsensus(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("genesis mismatch: stored {stored}, expected {expected}")] GenesisMismatch { stored: String, expected: String },
    #[error("block not found at height {0}")] MissingHeight(u32),
    #[error("broken link at height {height}: previous {previous} != {expected}")] BrokenLink { height: u32, previous: String, expected: String },
    #[error("height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u32, got: u32 },
    #[error("transaction not found: {0}")] MissingTx(String),
    #[error("output {txid}:{index} does not exist")] MissingOutput { txid: String, index: u8 },
    #[error("transaction {txid} height mismatch: expected {expected}, got {got:?}")] TxHeight { txid: String, expected: u32, got: Option<u32> },
    #[error("address index entry missing for {0}")] MissingIndex(String),
    #[error("address index entry mismatch for {0}")] IndexMismatch(String),
    #[error("output {txid}:{index} is not marked used")] NotMarkedUsed { txid: String, index: u8 },
    #[error("double spend of {txid}:{index}")] DoubleSpend { txid: String, index: u8 },
    #[error("entry {index} for {address} is not newer than {last}")] OlderThanLast { address: String, index: u64, last: u64 },
    #[error("transaction {0} is not part of its block")] NotInBlock(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already confirmed at height {0}")] AlreadyConfirmed(u32),
    #[error(transparent)] Format(#[from] FormatError),
}

#[derive(Error, Debug)]
pub enum ForklineError {
    #[error(transparent)] Format(#[from] FormatError),
    #[error(transparent)] Validation(#[from] ValidationError),
    #[error(transparent)] Consistency(#[from] ConsistencyError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error("batch lock not acquired within {0:?}")] Timeout(Duration),
    #[error("unreachable ancestor: {0}")] UnreachableAncestor(String),
    #[error("resync from height zero required: {0}")] ResyncRequired(String),
    #[error("batch: {0}")] Batch(String),
    #[error("config: {0}")] Config(String),
    #[error("storage: {0}")] Storage(String),
}
