//! Rotating chain-tip snapshots.
//!
//! Generation 0 (`starter.0.dat`) is the newest; saving shifts every
//! generation up by one and drops the one past [`SNAPSHOT_GENERATIONS`].
//! A new generation is written to `starter.0.dat.tmp` and renamed into place
//! only after the rotation, so an interrupted save leaves every complete
//! generation intact. The fail mark `starter.failed.dat` is only written by
//! callers that flag the newest snapshot as unusable.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use forkline_core::constants::SNAPSHOT_GENERATIONS;
use forkline_core::error::{ForklineError, FormatError};
use forkline_core::types::Block;

const FAILMARK_FILE: &str = "starter.failed.dat";

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Use `dir` for snapshot files, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ForklineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| ForklineError::Storage(e.to_string()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, generation: usize) -> PathBuf {
        self.dir.join(format!("starter.{generation}.dat"))
    }

    fn staging_path(&self) -> PathBuf {
        self.dir.join("starter.0.dat.tmp")
    }

    fn failmark_path(&self) -> PathBuf {
        self.dir.join(FAILMARK_FILE)
    }

    /// Persist `blocks` (oldest first) as the newest generation.
    pub fn save(&self, blocks: &[Block]) -> Result<(), ForklineError> {
        let bytes = bincode::encode_to_vec(blocks, bincode::config::standard())
            .map_err(|e| ForklineError::Storage(e.to_string()))?;
        let staging = self.staging_path();
        fs::write(&staging, bytes).map_err(|e| ForklineError::Storage(e.to_string()))?;

        for generation in (0..SNAPSHOT_GENERATIONS).rev() {
            let from = self.path(generation);
            if !from.exists() {
                continue;
            }
            let to = self.path(generation + 1);
            if to.exists() {
                fs::remove_file(&to).map_err(|e| ForklineError::Storage(e.to_string()))?;
            }
            fs::rename(&from, &to).map_err(|e| ForklineError::Storage(e.to_string()))?;
        }
        fs::rename(&staging, self.path(0)).map_err(|e| ForklineError::Storage(e.to_string()))?;
        debug!(blocks = blocks.len(), "snapshot saved");
        Ok(())
    }

    /// Append a timestamped line to the fail mark, creating it if absent.
    pub fn make_failmark(&self, reason: &str) -> Result<(), ForklineError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.failmark_path())
            .map_err(|e| ForklineError::Storage(e.to_string()))?;
        writeln!(file, "{} {reason}", chrono::Utc::now().to_rfc3339())
            .map_err(|e| ForklineError::Storage(e.to_string()))
    }

    pub fn has_failmark(&self) -> bool {
        self.failmark_path().exists()
    }

    /// Resolve a pending fail mark by discarding the newest generation.
    ///
    /// Returns whether a generation was discarded. With a fail mark and no
    /// generation left the node cannot recover from snapshots.
    pub fn check_failmark(&self) -> Result<bool, ForklineError> {
        if !self.has_failmark() {
            return Ok(false);
        }
        let reason = fs::read_to_string(self.failmark_path()).unwrap_or_default();
        let Some(newest) = self.generations().into_iter().next() else {
            return Err(ForklineError::ResyncRequired(format!(
                "snapshot fail mark present with no generation left: {}",
                reason.trim()
            )));
        };
        fs::remove_file(self.path(newest)).map_err(|e| ForklineError::Storage(e.to_string()))?;
        fs::remove_file(self.failmark_path()).map_err(|e| ForklineError::Storage(e.to_string()))?;
        warn!(generation = newest, reason = reason.trim(), "discarded snapshot behind fail mark");
        Ok(true)
    }

    /// Existing generations, newest first.
    pub fn generations(&self) -> Vec<usize> {
        (0..=SNAPSHOT_GENERATIONS).filter(|g| self.path(*g).exists()).collect()
    }

    /// Blocks of one generation, `None` if that file does not exist.
    pub fn read(&self, generation: usize) -> Result<Option<Vec<Block>>, ForklineError> {
        let path = self.path(generation);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| ForklineError::Storage(e.to_string()))?;
        let (blocks, read): (Vec<Block>, usize) = bincode::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| FormatError::Payload(e.to_string()))?;
        if read != bytes.len() {
            return Err(FormatError::LengthMismatch { expected: read, actual: bytes.len() }.into());
        }
        info!(generation, blocks = blocks.len(), "snapshot read");
        Ok(Some(blocks))
    }
}
