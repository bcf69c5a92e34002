//! Property-based adversarial tests for Forkline.
//!
//! Uses proptest to throw malformed encodings, hostile timestamp histories
//! and double spends at the codec, the difficulty oracle and the store.

use forkline_core::codec::{decode_tx_body, decode_tx_record, encode_tx_body, encode_tx_record};
use forkline_core::constants::{ADDRESS_LEN, ChainParams, MAX_BITS, NetworkType};
use forkline_core::difficulty::{DifficultyOracle, MAX_TARGET, bits_to_target, difficulty_of};
use forkline_core::error::{ConsistencyError, ForklineError, MempoolError};
use forkline_core::mempool::Mempool;
use forkline_core::traits::MemoryBlockIndex;
use forkline_core::types::*;
use forkline_node_lib::ChainSettings;
use forkline_tests::helpers::*;
use num_bigint::BigUint;
use proptest::prelude::*;

// ------------------------------------------------------------------
// Strategies
// ------------------------------------------------------------------

fn tx_type_strategy() -> impl Strategy<Value = TxType> {
    prop_oneof![
        Just(TxType::Genesis),
        Just(TxType::PowReward),
        Just(TxType::PosReward),
        Just(TxType::Transfer),
        Just(TxType::MintCoin),
        Just(TxType::ValidatorEdit),
        Just(TxType::ContractConclude),
        Just(TxType::ContractStart),
        Just(TxType::Inner),
    ]
}

fn address_strategy() -> impl Strategy<Value = Address> {
    proptest::collection::vec(0x21u8..0x7f, ADDRESS_LEN)
        .prop_map(|bytes| Address::from_bytes(&bytes).unwrap())
}

fn input_strategy() -> impl Strategy<Value = TxInput> {
    (any::<[u8; 32]>(), any::<u8>()).prop_map(|(hash, index)| TxInput { previous_hash: Hash256(hash), index })
}

fn output_strategy() -> impl Strategy<Value = TxOutput> {
    (address_strategy(), any::<u32>(), any::<u64>()).prop_map(|(address, coin_id, amount)| TxOutput {
        address,
        coin_id,
        amount,
    })
}

fn tx_strategy() -> impl Strategy<Value = Transaction> {
    (
        (tx_type_strategy(), any::<u32>(), any::<u32>(), any::<u64>(), any::<i64>()),
        prop_oneof![Just(MessageType::None), Just(MessageType::Plain), Just(MessageType::Bytes)],
        proptest::collection::vec(any::<u8>(), 0..64),
        proptest::collection::vec(input_strategy(), 0..4),
        proptest::collection::vec(output_strategy(), 0..4),
    )
        .prop_map(|((tx_type, time, deadline, gas_price, gas_amount), message_type, message, inputs, outputs)| {
            Transaction {
                version: 1,
                tx_type,
                time,
                deadline,
                gas_price,
                gas_amount,
                message_type,
                message,
                inputs,
                outputs,
                signatures: Vec::new(),
                height: None,
            }
        })
}

fn single_algorithm_oracle() -> DifficultyOracle {
    DifficultyOracle::new(ChainParams {
        block_time_span: 600,
        consensus_shares: vec![(Consensus::Yespower, 100)],
        ..ChainParams::default()
    })
}

const STEADY_BITS: u32 = 0x1d00_ffff;

// ------------------------------------------------------------------
// Codec
// ------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn tx_body_decodes_to_the_same_transaction(tx in tx_strategy()) {
        let bytes = encode_tx_body(&tx).unwrap();
        prop_assert_eq!(decode_tx_body(&bytes).unwrap(), tx);
    }

    #[test]
    fn every_strict_prefix_of_a_body_is_rejected(tx in tx_strategy()) {
        let bytes = encode_tx_body(&tx).unwrap();
        for len in 0..bytes.len() {
            prop_assert!(decode_tx_body(&bytes[..len]).is_err(), "prefix of {} bytes decoded", len);
        }
    }

    #[test]
    fn trailing_bytes_are_rejected(tx in tx_strategy(), extra in proptest::collection::vec(any::<u8>(), 1..16)) {
        let mut bytes = encode_tx_body(&tx).unwrap();
        bytes.extend_from_slice(&extra);
        prop_assert!(decode_tx_body(&bytes).is_err());
    }

    #[test]
    fn tx_record_keeps_height_and_signatures(tx in tx_strategy(), height in any::<u32>(), sigs in 0usize..3) {
        let mut tx = tx;
        tx.height = Some(height);
        tx.signatures = (0..sigs)
            .map(|i| SignaturePair { public_key: [i as u8; 32], signature: [0xaa; 64] })
            .collect();
        let decoded = decode_tx_record(&encode_tx_record(&tx).unwrap()).unwrap();
        prop_assert_eq!(decoded.height, Some(height));
        prop_assert_eq!(decoded.txid().unwrap(), tx.txid().unwrap());
        prop_assert_eq!(decoded, tx);
    }

    #[test]
    fn random_bytes_never_panic_the_decoder(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_tx_body(&bytes);
        let _ = decode_tx_record(&bytes);
    }
}

// ------------------------------------------------------------------
// Difficulty oracle
// ------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Whatever the declared times, the target stays in `[1, MAX]` and is
    /// never more than three times harder than the window average.
    #[test]
    fn hostile_timestamps_keep_target_bounded(times in proptest::collection::vec(any::<u32>(), 46..70)) {
        let oracle = single_algorithm_oracle();
        let mut index = MemoryBlockIndex::new();
        let genesis = forkline_core::genesis::genesis_block(NetworkType::Mainnet).unwrap();
        let mut tip = index.insert(&genesis);
        for (i, time) in times.iter().enumerate() {
            let block = next_block(&tip, Consensus::Yespower, *time, STEADY_BITS, i as u32, Vec::new());
            tip = index.insert(&block);
        }

        let (bits, target) = oracle.get_bits_by_hash(&tip, Consensus::Yespower, &index).unwrap();
        prop_assert!(target >= BigUint::from(1u8));
        prop_assert!(target <= *MAX_TARGET);
        prop_assert!(bits_to_target(bits) <= *MAX_TARGET);
        let harder = difficulty_of(bits) / difficulty_of(STEADY_BITS);
        prop_assert!(harder <= 3.0 * 1.0001, "difficulty rose {}x", harder);
    }

    /// Fewer than `N + 1` same-algorithm ancestors answer the easiest target.
    #[test]
    fn short_history_answers_max_target(count in 1usize..45) {
        let oracle = single_algorithm_oracle();
        let mut index = MemoryBlockIndex::new();
        let genesis = forkline_core::genesis::genesis_block(NetworkType::Mainnet).unwrap();
        let mut tip = index.insert(&genesis);
        for i in 1..=count as u32 {
            let block = next_block(&tip, Consensus::Yespower, i * 600, STEADY_BITS, i, Vec::new());
            tip = index.insert(&block);
        }
        let (bits, _) = oracle.get_bits_by_hash(&tip, Consensus::Yespower, &index).unwrap();
        prop_assert_eq!(bits, MAX_BITS);
    }
}

// ------------------------------------------------------------------
// Mempool
// ------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn second_put_of_same_tx_is_ignored(tx in tx_strategy()) {
        let mut pool = Mempool::new();
        let block_only = matches!(tx.tx_type, TxType::Genesis | TxType::PowReward | TxType::PosReward);
        prop_assert_eq!(pool.put_unconfirmed(tx.clone()).unwrap(), !block_only);
        prop_assert!(!pool.put_unconfirmed(tx).unwrap());
        prop_assert_eq!(pool.len(), usize::from(!block_only));
    }

    #[test]
    fn confirmed_transactions_are_refused(tx in tx_strategy(), height in any::<u32>()) {
        let mut pool = Mempool::new();
        let mut tx = tx;
        tx.height = Some(height);
        prop_assert_eq!(pool.put_unconfirmed(tx), Err(MempoolError::AlreadyConfirmed(height)));
        prop_assert!(pool.is_empty());
    }
}

// ------------------------------------------------------------------
// Store atomicity
// ------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// A second spend of the genesis output anywhere in a flush rejects the
    /// whole batch and leaves the store untouched.
    #[test]
    fn double_spend_anywhere_in_batch_rolls_back(first in 1u32..=9, second in 1u32..=9) {
        let dir = tempfile::tempdir().unwrap();
        let settings = ChainSettings { batch_size: 10, ..ChainSettings::default() };
        let chain = open_chain(dir.path(), NetworkType::Regtest, NetworkType::Regtest.params(), settings);
        let genesis_out = (genesis_txid(NetworkType::Regtest), 0);

        let mut tip = chain.genesis_hash();
        for height in 1..=9u32 {
            let mut txs = Vec::new();
            if height == first {
                txs.push(make_transfer(1, FAR_DEADLINE, &[genesis_out], &[(addr('A'), 1)]));
            }
            if height == second {
                txs.push(make_transfer(2, FAR_DEADLINE, &[genesis_out], &[(addr('B'), 1)]));
            }
            let block = next_block(&tip, Consensus::Yespower, height, MAX_BITS, height, txs);
            tip = block.hash();
            chain.new_block(block).unwrap();
        }

        let err = chain.batch_apply(true).unwrap_err();
        let is_double_spend = matches!(err, ForklineError::Consistency(ConsistencyError::DoubleSpend { .. }));
        prop_assert!(is_double_spend, "unexpected error: {}", err);
        prop_assert_eq!(chain.root(), None);
        prop_assert_eq!(chain.memory_len(), 10);
        prop_assert!(chain.db().read_block_hash(0).unwrap().is_none());
        prop_assert!(!chain.db().has_open_batch());
    }
}
