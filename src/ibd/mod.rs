//! Initial block download over the HTTP RPC of other nodes
//!
//! Used at startup when the node is far behind; gossip takes over once the
//! gap is small.

mod manager;

pub use manager::*;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::constants::MAX_BLOCKS_PER_BATCH;

/// IBD errors
#[derive(Debug, Error)]
pub enum IbdError {
    /// Network error, bad status, timeout or a rejected block; try again or move on
    #[error("retryable: {0}")]
    Retryable(String),
    /// Nothing left to try; the node stays on its current tip
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<reqwest::Error> for IbdError {
    fn from(e: reqwest::Error) -> Self {
        IbdError::Retryable(e.to_string())
    }
}

/// IBD tuning
#[derive(Debug, Clone)]
pub struct IbdConfig {
    pub batch_size: u32,
    /// Minimum gap that triggers IBD
    pub ibd_threshold: u64,
    /// Gap at which IBD hands over to gossip
    pub catch_up_threshold: u64,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub progress_interval: Duration,
    pub request_timeout: Duration,
    pub state_file: PathBuf,
}

impl IbdConfig {
    /// Defaults with the state file in `db_dir`
    pub fn new(db_dir: impl AsRef<Path>) -> Self {
        Self {
            batch_size: MAX_BLOCKS_PER_BATCH,
            ibd_threshold: 200,
            catch_up_threshold: 50,
            retry_delay: Duration::from_secs(5),
            max_retries: 5,
            progress_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            state_file: db_dir.as_ref().join("ibd_state.json"),
        }
    }
}

/// Resumable progress record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbdState {
    pub in_progress: bool,
    pub start_height: u64,
    pub current_height: u64,
    pub target_height: u64,
    pub peer_url: String,
    pub started_at: i64,
}

impl IbdState {
    pub fn load(path: &Path) -> Option<Self> {
        let raw = fs::read(path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let raw = serde_json::to_vec_pretty(self)?;
        fs::write(path, raw)
    }

    pub fn clear(path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Percent of the range covered so far
    pub fn progress(&self) -> f64 {
        let total = self.target_height.saturating_sub(self.start_height);
        if total == 0 {
            return 100.0;
        }
        let done = self.current_height.saturating_sub(self.start_height);
        done as f64 * 100.0 / total as f64
    }
}
