//! # forkline-core
//! Ledger types, wire codec, difficulty oracle, block validation and mempool
//! for the Forkline consensus core.

pub mod block_validation;
pub mod codec;
pub mod constants;
pub mod contract;
pub mod difficulty;
pub mod error;
pub mod genesis;
pub mod mempool;
pub mod merkle;
pub mod traits;
pub mod types;
