//! Core ledger types: hashes, addresses, transactions, blocks.
//!
//! Transaction and block times are seconds since the network's genesis time
//! (see [`ChainParams::genesis_time`](crate::constants::ChainParams)).

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::codec;
use crate::constants::ADDRESS_LEN;
use crate::difficulty;
use crate::error::FormatError;

/// A 32-byte hash value.
///
/// Used for transaction ids, block hashes and merkle roots, all double SHA-256.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Copy a hash out of a 32-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, FormatError> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| FormatError::Truncated {
            needed: 32,
            available: bytes.len(),
        })?;
        Ok(Self(array))
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, FormatError> {
        let bytes = hex::decode(s).map_err(|e| FormatError::Payload(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// SHA-256 applied twice.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// A 40-byte ASCII address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// Build from raw bytes, rejecting anything that is not printable ASCII.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let array: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| FormatError::InvalidAddress(format!("length {}", bytes.len())))?;
        if !array.iter().all(|b| b.is_ascii_graphic()) {
            return Err(FormatError::InvalidAddress(String::from_utf8_lossy(bytes).into_owned()));
        }
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// True when the address starts with the contract prefix byte.
    pub fn is_contract(&self, prefix: u8) -> bool {
        self.0[0] == prefix
    }
}

impl FromStr for Address {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// Transaction type tag, `u32` on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub enum TxType {
    Genesis,
    PowReward,
    PosReward,
    Transfer,
    MintCoin,
    ValidatorEdit,
    ContractConclude,
    ContractStart,
    Inner,
}

impl TxType {
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Genesis => 0,
            Self::PowReward => 1,
            Self::PosReward => 2,
            Self::Transfer => 3,
            Self::MintCoin => 4,
            Self::ValidatorEdit => 5,
            Self::ContractConclude => 6,
            Self::ContractStart => 7,
            Self::Inner => 255,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self, FormatError> {
        Ok(match value {
            0 => Self::Genesis,
            1 => Self::PowReward,
            2 => Self::PosReward,
            3 => Self::Transfer,
            4 => Self::MintCoin,
            5 => Self::ValidatorEdit,
            6 => Self::ContractConclude,
            7 => Self::ContractStart,
            255 => Self::Inner,
            other => return Err(FormatError::UnknownTxType(other)),
        })
    }

    /// Block rewards never enter the mempool.
    pub fn is_reward(self) -> bool {
        matches!(self, Self::PowReward | Self::PosReward)
    }
}

/// How the message bytes of a transaction are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, bincode::Encode, bincode::Decode)]
pub enum MessageType {
    #[default]
    None,
    Plain,
    Bytes,
}

impl MessageType {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Plain => 1,
            Self::Bytes => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, FormatError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Plain),
            2 => Ok(Self::Bytes),
            other => Err(FormatError::UnknownMessageType(other)),
        }
    }
}

/// Block production algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub enum Consensus {
    Genesis,
    Stake,
    Yespower,
    X11,
    X16s,
}

impl Consensus {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Genesis => 0,
            Self::Stake => 1,
            Self::Yespower => 2,
            Self::X11 => 3,
            Self::X16s => 4,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, FormatError> {
        match value {
            0 => Ok(Self::Genesis),
            1 => Ok(Self::Stake),
            2 => Ok(Self::Yespower),
            3 => Ok(Self::X11),
            4 => Ok(Self::X16s),
            other => Err(FormatError::UnknownConsensus(other)),
        }
    }

    /// Type of the first transaction of a block produced by this algorithm.
    pub fn reward_type(self) -> TxType {
        match self {
            Self::Genesis => TxType::Genesis,
            Self::Stake => TxType::PosReward,
            Self::Yespower | Self::X11 | Self::X16s => TxType::PowReward,
        }
    }
}

/// Reference to an output of a previous transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub struct TxInput {
    pub previous_hash: Hash256,
    pub index: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxOutput {
    pub address: Address,
    pub coin_id: u32,
    pub amount: u64,
}

/// One public key and the signature it produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SignaturePair {
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
}

/// A transaction. `height` is `Some` only while it sits on the best chain.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    pub version: u32,
    pub tx_type: TxType,
    pub time: u32,
    pub deadline: u32,
    pub gas_price: u64,
    pub gas_amount: i64,
    pub message_type: MessageType,
    pub message: Vec<u8>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub signatures: Vec<SignaturePair>,
    pub height: Option<u32>,
}

impl Transaction {
    /// Transaction id: double SHA-256 of the encoded body.
    pub fn txid(&self) -> Result<Hash256, FormatError> {
        Ok(double_sha256(&codec::encode_tx_body(self)?))
    }

    /// Encoded body plus signature blob.
    pub fn size(&self) -> Result<usize, FormatError> {
        Ok(codec::encode_tx_body(self)?.len() + self.signatures.len() * codec::SIGNATURE_PAIR_LEN)
    }
}

/// The 80-byte block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SIZE: usize = 80;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.previous_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() != Self::SIZE {
            return Err(FormatError::LengthMismatch { expected: Self::SIZE, actual: bytes.len() });
        }
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Ok(Self {
            version: word(0),
            previous_hash: Hash256::from_slice(&bytes[4..36])?,
            merkle_root: Hash256::from_slice(&bytes[36..68])?,
            time: word(68),
            bits: word(72),
            nonce: word(76),
        })
    }

    /// Block hash: double SHA-256 of the header bytes.
    pub fn hash(&self) -> Hash256 {
        double_sha256(&self.to_bytes())
    }
}

/// A block and the bookkeeping the fork manager keeps beside it.
#[derive(Clone, Debug, PartialEq, bincode::Encode, bincode::Decode)]
pub struct Block {
    pub header: BlockHeader,
    /// Assigned from the parent when the block enters the chain index.
    pub height: u32,
    pub consensus: Consensus,
    /// Cross-algorithm normalization factor; 1.0 unless recomputed.
    pub bias: f64,
    pub work_hash: Hash256,
    pub transactions: Vec<Transaction>,
    pub orphan: bool,
    pub on_memory: bool,
    /// Local unix time the block was received. Not persisted.
    pub received_at: u64,
}

impl Block {
    pub fn new(header: BlockHeader, consensus: Consensus, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            height: 0,
            consensus,
            bias: 1.0,
            work_hash: Hash256::ZERO,
            transactions,
            orphan: false,
            on_memory: false,
            received_at: 0,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn previous_hash(&self) -> &Hash256 {
        &self.header.previous_hash
    }

    /// Fork-choice weight: difficulty normalized by the bias.
    pub fn score(&self) -> f64 {
        let bias = if self.bias > 0.0 { self.bias } else { 1.0 };
        difficulty::difficulty_of(self.header.bits) / bias
    }

    /// Header plus every encoded transaction.
    pub fn size(&self) -> Result<usize, FormatError> {
        self.transactions
            .iter()
            .try_fold(BlockHeader::SIZE, |acc, tx| Ok(acc + tx.size()?))
    }

    pub fn txids(&self) -> Result<Vec<Hash256>, FormatError> {
        self.transactions.iter().map(Transaction::txid).collect()
    }
}
