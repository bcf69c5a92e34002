//! End-to-end and adversarial test suite for Forkline.
//!
//! The tests drive the fork manager and the node against real RocksDB
//! stores in temporary directories: retargeting across the memory/store
//! boundary, deep reorgs, mempool pruning, atomic flushes and restart
//! recovery.

pub mod helpers;
