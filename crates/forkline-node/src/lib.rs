//! # forkline-node: persistent ledger and fork management.
//!
//! Composes the Forkline core into a running node:
//! - [`storage::ChainDb`]: RocksDB tables with a single owned write batch
//! - [`snapshot::SnapshotStore`]: rotating chain-tip snapshots
//! - [`chain::Chain`]: in-memory fork tracker, flushing into the store
//! - [`node::Node`]: acceptance pipeline wiring validation, chain and mempool
//! - [`config::NodeConfig`]: node configuration

pub mod chain;
pub mod config;
pub mod node;
pub mod snapshot;
pub mod storage;

pub use chain::{Chain, ChainEvent, ChainSettings};
pub use config::NodeConfig;
pub use node::Node;
pub use snapshot::SnapshotStore;
pub use storage::ChainDb;
