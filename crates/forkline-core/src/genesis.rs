//! Genesis block definition.
//!
//! The genesis block sits at height 0 above the [`GENESIS_PREVIOUS_HASH`]
//! sentinel. It carries a single `Genesis` transaction with a network-tagged
//! message and the initial allocation. Every node computes the identical
//! block for a given network.

use crate::constants::{GENESIS_PREVIOUS_HASH, MAX_BITS, NetworkType};
use crate::error::FormatError;
use crate::merkle;
use crate::types::{
    Address, Block, BlockHeader, Consensus, MessageType, Transaction, TxOutput, TxType,
};

/// Message embedded in the genesis transaction, followed by the network name.
pub const GENESIS_MESSAGE: &[u8] = b"forkline genesis: many algorithms, one chain";

/// Initial allocation paid by the genesis transaction.
pub const GENESIS_ALLOCATION: u64 = 1_000_000_000_000;

/// Recipient of the initial allocation, right-padded to 40 bytes.
pub fn genesis_address() -> Result<Address, FormatError> {
    format!("{:0<40}", "NGENESIS").parse()
}

/// The genesis transaction for `network`.
pub fn genesis_transaction(network: NetworkType) -> Result<Transaction, FormatError> {
    let mut message = GENESIS_MESSAGE.to_vec();
    message.push(b' ');
    message.extend_from_slice(network.dir_name().as_bytes());
    Ok(Transaction {
        version: 1,
        tx_type: TxType::Genesis,
        time: 0,
        deadline: 0,
        gas_price: 0,
        gas_amount: 0,
        message_type: MessageType::Plain,
        message,
        inputs: Vec::new(),
        outputs: vec![TxOutput {
            address: genesis_address()?,
            coin_id: 0,
            amount: GENESIS_ALLOCATION,
        }],
        signatures: Vec::new(),
        height: None,
    })
}

/// The genesis block (height 0) for `network`.
pub fn genesis_block(network: NetworkType) -> Result<Block, FormatError> {
    let tx = genesis_transaction(network)?;
    let merkle_root = merkle::merkle_root(&[tx.txid()?]);
    let header = BlockHeader {
        version: 1,
        previous_hash: GENESIS_PREVIOUS_HASH,
        merkle_root,
        time: 0,
        bits: MAX_BITS,
        nonce: 0,
    };
    Ok(Block::new(header, Consensus::Genesis, vec![tx]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_block_deterministic() {
        let a = genesis_block(NetworkType::Mainnet).unwrap();
        let b = genesis_block(NetworkType::Mainnet).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn networks_have_distinct_genesis() {
        let main = genesis_block(NetworkType::Mainnet).unwrap().hash();
        let test = genesis_block(NetworkType::Testnet).unwrap().hash();
        assert_ne!(main, test);
    }

    #[test]
    fn genesis_sits_on_sentinel() {
        let block = genesis_block(NetworkType::Regtest).unwrap();
        assert_eq!(block.header.previous_hash, GENESIS_PREVIOUS_HASH);
        assert_eq!(block.consensus, Consensus::Genesis);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].tx_type, TxType::Genesis);
        assert_eq!(block.header.merkle_root, block.transactions[0].txid().unwrap());
    }

    #[test]
    fn genesis_address_is_padded() {
        let addr = genesis_address().unwrap();
        assert!(addr.to_string().starts_with("NGENESIS0"));
    }
}
