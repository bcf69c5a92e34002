//! Shared builders for the end-to-end and adversarial tests.

use std::path::Path;
use std::sync::Arc;

use forkline_core::constants::{ChainParams, NetworkType};
use forkline_core::difficulty::DifficultyOracle;
use forkline_core::genesis::genesis_block;
use forkline_core::merkle;
use forkline_core::types::*;
use forkline_node_lib::{Chain, ChainDb, ChainSettings, NodeConfig, SnapshotStore};

/// Deadline far past any realistic clock.
pub const FAR_DEADLINE: u32 = u32::MAX - 1;

/// A 40-byte address made of one repeated character.
pub fn addr(c: char) -> Address {
    c.to_string().repeat(40).parse().unwrap()
}

/// Reward transaction for `consensus`, made unique by `marker`.
pub fn make_reward(consensus: Consensus, marker: u32) -> Transaction {
    make_tx(consensus.reward_type(), marker, FAR_DEADLINE, Vec::new(), Vec::new())
}

/// Unsigned transaction of any type.
pub fn make_tx(
    tx_type: TxType,
    time: u32,
    deadline: u32,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
) -> Transaction {
    Transaction {
        version: 1,
        tx_type,
        time,
        deadline,
        gas_price: 0,
        gas_amount: 0,
        message_type: MessageType::None,
        message: Vec::new(),
        inputs,
        outputs,
        signatures: Vec::new(),
        height: None,
    }
}

/// Transfer spending `(txid, index)` pairs into `(address, amount)` outputs.
pub fn make_transfer(time: u32, deadline: u32, inputs: &[(Hash256, u8)], outputs: &[(Address, u64)]) -> Transaction {
    make_tx(
        TxType::Transfer,
        time,
        deadline,
        inputs.iter().map(|(previous_hash, index)| TxInput { previous_hash: *previous_hash, index: *index }).collect(),
        outputs.iter().map(|(address, amount)| TxOutput { address: *address, coin_id: 0, amount: *amount }).collect(),
    )
}

/// Block with a correct merkle root. `nonce` keeps sibling blocks apart.
pub fn make_block(
    previous_hash: Hash256,
    consensus: Consensus,
    time: u32,
    bits: u32,
    nonce: u32,
    txs: Vec<Transaction>,
) -> Block {
    let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid().unwrap()).collect();
    let header = BlockHeader {
        version: 1,
        previous_hash,
        merkle_root: merkle::merkle_root(&txids),
        time,
        bits,
        nonce,
    };
    Block::new(header, consensus, txs)
}

/// Child of `parent` holding only a reward plus `txs`.
pub fn next_block(parent: &Hash256, consensus: Consensus, time: u32, bits: u32, nonce: u32, txs: Vec<Transaction>) -> Block {
    let mut all = vec![make_reward(consensus, nonce)];
    all.extend(txs);
    make_block(*parent, consensus, time, bits, nonce, all)
}

/// Genesis transaction id for `network`.
pub fn genesis_txid(network: NetworkType) -> Hash256 {
    genesis_block(network).unwrap().transactions[0].txid().unwrap()
}

/// Open a chain in `dir` with explicit params and settings.
pub fn open_chain(dir: &Path, network: NetworkType, params: ChainParams, settings: ChainSettings) -> Chain {
    let db = Arc::new(ChainDb::open(dir.join("chaindata"), false).unwrap());
    let snapshots = SnapshotStore::new(dir.join("snapshots")).unwrap();
    let oracle = Arc::new(DifficultyOracle::new(params));
    Chain::open(db, snapshots, genesis_block(network).unwrap(), settings, oracle).unwrap()
}

/// Regtest node configuration rooted at `dir`.
pub fn regtest_config(dir: &Path) -> NodeConfig {
    NodeConfig {
        data_dir: dir.to_path_buf(),
        network: NetworkType::Regtest,
        sync_writes: false,
        ..NodeConfig::default()
    }
}
