//! Node configuration for the Forkline node.
//!
//! [`NodeConfig`] carries defaults for every tunable. [`NodeConfig::load`]
//! layers an optional config file and `FORKLINE_*` environment variables on
//! top of them; the binary then applies its command-line overrides.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use forkline_core::constants::{ChainParams, DEFAULT_BATCH_SIZE, DEFAULT_CACHE_LIMIT, NetworkType};
use forkline_core::error::ForklineError;
use forkline_core::types::Address;

use crate::chain::ChainSettings;

/// Configuration for a node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory; each network gets its own subdirectory.
    pub data_dir: PathBuf,
    pub network: NetworkType,
    /// Log level filter string (e.g. "info", "debug", "forkline_node_lib=trace").
    pub log_level: String,
    /// Log output format, "text" or "json".
    pub log_format: String,
    /// Blocks held in memory before a flush.
    pub cache_limit: usize,
    /// Most blocks written per flush.
    pub batch_size: usize,
    /// Seconds a flush waits for the store batch; 0 waits forever.
    pub batch_timeout_secs: u64,
    pub full_address_index: bool,
    /// Addresses indexed even when `full_address_index` is off.
    pub watch_addresses: Vec<String>,
    /// fsync every committed batch.
    pub sync_writes: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("forkline");

        Self {
            data_dir,
            network: NetworkType::Mainnet,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            cache_limit: DEFAULT_CACHE_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout_secs: 30,
            full_address_index: false,
            watch_addresses: Vec::new(),
            sync_writes: true,
        }
    }
}

impl NodeConfig {
    /// Defaults, overlaid by `file` (if any), overlaid by `FORKLINE_*`
    /// environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, ForklineError> {
        let defaults = config::Config::try_from(&NodeConfig::default())
            .map_err(|e| ForklineError::Config(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FORKLINE")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("watch_addresses"),
        );
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ForklineError::Config(e.to_string()))
    }

    /// Directory holding this network's store and snapshots.
    pub fn chain_dir(&self) -> PathBuf {
        self.data_dir.join(self.network.dir_name())
    }

    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.chain_dir().join("chaindata")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.chain_dir().join("snapshots")
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        (self.batch_timeout_secs > 0).then(|| Duration::from_secs(self.batch_timeout_secs))
    }

    pub fn params(&self) -> ChainParams {
        self.network.params()
    }

    /// Fork manager settings; fails on a malformed watched address.
    pub fn chain_settings(&self) -> Result<ChainSettings, ForklineError> {
        let watch_addresses = self
            .watch_addresses
            .iter()
            .map(|s| s.parse::<Address>())
            .collect::<Result<HashSet<_>, _>>()
            .map_err(|e| ForklineError::Config(e.to_string()))?;
        Ok(ChainSettings {
            cache_limit: self.cache_limit,
            batch_size: self.batch_size,
            batch_timeout: self.batch_timeout(),
            full_address_index: self.full_address_index,
            watch_addresses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_level_is_info() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.log_format, "text");
    }

    #[test]
    fn default_data_dir_ends_with_forkline() {
        let cfg = NodeConfig::default();
        assert!(
            cfg.data_dir.ends_with("forkline"),
            "data_dir should end with 'forkline': {:?}",
            cfg.data_dir
        );
    }

    #[test]
    fn paths_are_per_network() {
        let cfg = NodeConfig {
            data_dir: PathBuf::from("/tmp/forkline-test"),
            network: NetworkType::Regtest,
            ..NodeConfig::default()
        };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/forkline-test/regtest/chaindata"));
        assert_eq!(cfg.snapshot_dir(), PathBuf::from("/tmp/forkline-test/regtest/snapshots"));
    }

    #[test]
    fn zero_timeout_waits_forever() {
        let cfg = NodeConfig { batch_timeout_secs: 0, ..NodeConfig::default() };
        assert_eq!(cfg.batch_timeout(), None);
        assert_eq!(NodeConfig::default().batch_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forkline.toml");
        std::fs::write(&path, "network = \"testnet\"\ncache_limit = 50\nfull_address_index = true\n").unwrap();
        let cfg = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.network, NetworkType::Testnet);
        assert_eq!(cfg.cache_limit, 50);
        assert!(cfg.full_address_index);
        assert_eq!(cfg.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn bad_watch_address_is_config_error() {
        let cfg = NodeConfig { watch_addresses: vec!["short".into()], ..NodeConfig::default() };
        assert!(matches!(cfg.chain_settings(), Err(ForklineError::Config(_))));
        let ok = NodeConfig { watch_addresses: vec!["W".repeat(40)], ..NodeConfig::default() };
        assert_eq!(ok.chain_settings().unwrap().watch_addresses.len(), 1);
    }
}
