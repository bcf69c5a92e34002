//! End-to-end integration tests for Forkline.
//!
//! Each test opens a chain or a full node on a temporary RocksDB store and
//! drives it through block acceptance, reorgs, flushes and restarts.

use forkline_core::constants::{ChainParams, MAX_BITS, NetworkType};
use forkline_core::difficulty::difficulty_of;
use forkline_core::error::{ForklineError, ValidationError};
use forkline_core::types::*;
use forkline_node_lib::chain::unix_now;
use forkline_node_lib::{ChainEvent, ChainSettings, Node, NodeConfig};
use forkline_tests::helpers::*;

const STEADY_BITS: u32 = 0x1d00_ffff;

fn single_algorithm_params() -> ChainParams {
    ChainParams {
        block_time_span: 600,
        consensus_shares: vec![(Consensus::Yespower, 100)],
        ..ChainParams::default()
    }
}

#[test]
fn steady_history_retargets_near_unbiased_target() {
    let dir = tempfile::tempdir().unwrap();
    let settings = ChainSettings { batch_size: 30, ..ChainSettings::default() };
    let chain = open_chain(dir.path(), NetworkType::Mainnet, single_algorithm_params(), settings);

    let mut tip = chain.genesis_hash();
    for i in 1..=60u32 {
        let block = next_block(&tip, Consensus::Yespower, i * 600, STEADY_BITS, i, Vec::new());
        tip = block.hash();
        chain.new_block(block).unwrap();
    }
    // Half the window now lives in the store, half in memory.
    assert_eq!(chain.batch_apply(true).unwrap().len(), 30);
    assert_eq!(chain.root().map(|r| r.1), Some(29));

    let (bits, _) = chain.oracle().get_bits_by_hash(&tip, Consensus::Yespower, &chain).unwrap();
    let ratio = difficulty_of(bits) / difficulty_of(STEADY_BITS);
    assert!((0.98..=1.02).contains(&ratio), "difficulty ratio {ratio}");
    assert_eq!(chain.oracle().get_bias_by_hash(&tip, Consensus::Yespower, &chain).unwrap(), 1.0);
}

#[test]
fn longer_fork_wins_and_returns_transactions_to_mempool() {
    let dir = tempfile::tempdir().unwrap();
    let chain = open_chain(dir.path(), NetworkType::Regtest, NetworkType::Regtest.params(), ChainSettings::default());
    let mut events = chain.subscribe();
    let genesis = chain.genesis_hash();

    let transfer = make_transfer(
        1,
        FAR_DEADLINE,
        &[(genesis_txid(NetworkType::Regtest), 0)],
        &[(addr('A'), 1_000)],
    );
    let transfer_id = transfer.txid().unwrap();

    let mut a_tip = genesis;
    for i in 1..=100u32 {
        let txs = if i == 5 { vec![transfer.clone()] } else { Vec::new() };
        let block = next_block(&a_tip, Consensus::Yespower, i, MAX_BITS, i, txs);
        a_tip = block.hash();
        chain.new_block(block).unwrap();
    }
    assert_eq!(chain.best_tip(), Some((a_tip, 100)));
    assert_eq!(chain.mempool().confirmed_height(&transfer_id), Some(5));

    let mut b_tip = genesis;
    for i in 1..=105u32 {
        let block = next_block(&b_tip, Consensus::X11, i, MAX_BITS, 10_000 + i, Vec::new());
        b_tip = block.hash();
        chain.new_block(block).unwrap();
    }
    assert_eq!(chain.best_tip(), Some((b_tip, 105)));
    assert_eq!(chain.memory_len(), 206);

    let pool = chain.mempool();
    assert!(pool.contains(&transfer_id));
    assert_eq!(pool.confirmed_height(&transfer_id), None);
    drop(pool);

    let removed_total: usize = std::iter::from_fn(|| events.try_recv().ok())
        .map(|event| match event {
            ChainEvent::BestChainChanged { removed, .. } => removed.len(),
            ChainEvent::Flushed { .. } => 0,
        })
        .sum();
    assert_eq!(removed_total, 100);

    let best = chain.get_best_chain(None).unwrap();
    assert_eq!(best.len(), 106);
    assert!(best.iter().all(|b| !b.orphan));
    assert!(chain.get_block(&a_tip).unwrap().unwrap().orphan);
    assert_eq!(chain.get_best_chain(Some(&a_tip)).unwrap().len(), 101);
}

#[test]
fn expired_transactions_are_pruned_on_chain_change() {
    let dir = tempfile::tempdir().unwrap();
    let chain = open_chain(dir.path(), NetworkType::Regtest, NetworkType::Regtest.params(), ChainSettings::default());
    let expired = make_transfer(1, 2, &[(Hash256([1; 32]), 0)], &[(addr('A'), 1)]);
    let alive = make_transfer(1, FAR_DEADLINE, &[(Hash256([2; 32]), 0)], &[(addr('A'), 1)]);
    assert!(chain.mempool().put_unconfirmed(expired.clone()).unwrap());
    assert!(chain.mempool().put_unconfirmed(alive.clone()).unwrap());

    let block = next_block(&chain.genesis_hash(), Consensus::Yespower, 1, MAX_BITS, 1, Vec::new());
    chain.new_block(block).unwrap();

    let pool = chain.mempool();
    assert!(!pool.contains(&expired.txid().unwrap()));
    assert!(pool.contains(&alive.txid().unwrap()));
}

#[test]
fn mempool_drops_transaction_spending_a_confirmed_output() {
    let dir = tempfile::tempdir().unwrap();
    let chain = open_chain(dir.path(), NetworkType::Regtest, NetworkType::Regtest.params(), ChainSettings::default());
    let genesis_out = (genesis_txid(NetworkType::Regtest), 0);
    let mined = make_transfer(1, FAR_DEADLINE, &[genesis_out], &[(addr('A'), 10)]);
    let conflicting = make_transfer(2, FAR_DEADLINE, &[genesis_out], &[(addr('B'), 10)]);
    chain.mempool().put_unconfirmed(conflicting.clone()).unwrap();

    chain.new_block(next_block(&chain.genesis_hash(), Consensus::Yespower, 1, MAX_BITS, 1, vec![mined])).unwrap();
    assert!(!chain.mempool().contains(&conflicting.txid().unwrap()));
}

#[test]
fn node_rejects_bad_blocks_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_window_config(dir.path());

    let tip = {
        let node = Node::open(config.clone()).unwrap();
        node.finish_initial_sync();
        let params = node.chain().params().clone();
        let now = params.relative_time(unix_now()) as u32;

        let mut tip = node.chain().genesis_hash();
        for i in 1..=6u32 {
            let block = next_block(&tip, Consensus::Yespower, now, MAX_BITS, i, Vec::new());
            tip = block.hash();
            assert!(node.accept_block(block, 0).unwrap());
        }
        assert!(node.chain().root().is_some());

        let mut bad_root = next_block(&tip, Consensus::Yespower, now, MAX_BITS, 99, Vec::new());
        bad_root.header.merkle_root = Hash256([9; 32]);
        let err = node.accept_block(bad_root, 0).unwrap_err();
        assert!(matches!(err, ForklineError::Validation(ValidationError::InvalidMerkleRoot)));

        let stale = next_block(&tip, Consensus::Yespower, now.saturating_sub(10_000), MAX_BITS, 98, Vec::new());
        let err = node.accept_block(stale, 0).unwrap_err();
        assert!(matches!(err, ForklineError::Validation(ValidationError::TimeOutOfRange { .. })));

        let wrong_reward = make_block(tip, Consensus::Stake, now, MAX_BITS, 97, vec![make_reward(Consensus::Yespower, 97)]);
        let err = node.accept_block(wrong_reward, 0).unwrap_err();
        assert!(matches!(err, ForklineError::Validation(ValidationError::UnexpectedReward { .. })));

        node.close().unwrap();
        tip
    };

    let node = Node::open(config).unwrap();
    assert_eq!(node.chain().best_tip(), Some((tip, 6)));
    assert!(node.chain().get_block_hash(1).unwrap().is_some());
}

/// Regtest config that flushes three blocks once four are in memory.
fn small_window_config(dir: &std::path::Path) -> NodeConfig {
    NodeConfig { cache_limit: 4, batch_size: 3, ..regtest_config(dir) }
}
