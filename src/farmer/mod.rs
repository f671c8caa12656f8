//! Farmer: scans plots against the node's challenge and submits winners

mod stats;

pub use stats::*;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{Address, Hash, PublicKey};
use crate::metrics::{Metrics, Watchdog};
use crate::pospace::{scan_plot, CancelToken, PlotError, PlotFile, PlotScanStats, Proof, ScanResult};
use crate::rpc::types::{ChallengeResponse, SubmitBlockRequest, SubmitBlockResponse, VdfInfo};

/// Plot file extension
pub const PLOT_EXTENSION: &str = "arcv";

#[derive(Debug, Error)]
pub enum FarmerError {
    #[error("plot directory: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Plot(#[from] PlotError),
    #[error("node request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no plots found in {0}")]
    NoPlots(PathBuf),
}

#[derive(Debug, Clone)]
pub struct FarmerConfig {
    pub node_url: String,
    pub plots_dir: PathBuf,
    pub farmer_pubkey: PublicKey,
    pub farmer_addr: Address,
    /// Delay between cycles
    pub poll_interval: Duration,
    /// How often `/challenge` is re-read while scans run
    pub preempt_check: Duration,
}

impl FarmerConfig {
    /// Defaults; the address is the legacy derivation of `farmer_pubkey`
    pub fn new(node_url: impl Into<String>, plots_dir: impl Into<PathBuf>, farmer_pubkey: PublicKey) -> Self {
        Self {
            node_url: node_url.into().trim_end_matches('/').to_string(),
            plots_dir: plots_dir.into(),
            farmer_addr: farmer_pubkey.legacy_address(),
            farmer_pubkey,
            poll_interval: Duration::from_secs(2),
            preempt_check: Duration::from_millis(250),
        }
    }
}

/// `*.arcv` files in `dir`, sorted by path
pub fn discover_plots(dir: &Path) -> Result<Vec<PathBuf>, FarmerError> {
    let mut plots: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == PLOT_EXTENSION))
        .collect();
    plots.sort();
    Ok(plots)
}

/// Scan every plot in parallel; plots that fail to open are logged and skipped
pub async fn scan_all(
    plots: &[PathBuf],
    challenge: Hash,
    difficulty: u64,
    cancel: &CancelToken,
) -> Vec<(ScanResult, PlotScanStats)> {
    let tasks: Vec<_> = plots
        .iter()
        .cloned()
        .map(|path| {
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                let mut plot = PlotFile::open(&path)?;
                scan_plot(&mut plot, &challenge, difficulty, &cancel)
            })
        })
        .collect();

    let mut out = Vec::with_capacity(tasks.len());
    for (task, path) in tasks.into_iter().zip(plots) {
        match task.await {
            Ok(Ok(result)) => out.push(result),
            Ok(Err(e)) => warn!("[farmer] skipping plot {}: {}", path.display(), e),
            Err(e) => warn!("[farmer] scan task for {} failed: {}", path.display(), e),
        }
    }
    out
}

/// Farming loop state
#[derive(Debug)]
pub struct Farmer {
    config: FarmerConfig,
    client: reqwest::Client,
    plots: Vec<PathBuf>,
    watchdog: Arc<Watchdog>,
    last_submitted: Option<Hash>,
}

impl Farmer {
    pub fn new(config: FarmerConfig, metrics: Arc<Metrics>) -> Result<Self, FarmerError> {
        let plots = discover_plots(&config.plots_dir)?;
        if plots.is_empty() {
            return Err(FarmerError::NoPlots(config.plots_dir.clone()));
        }
        for path in &plots {
            let plot = PlotFile::open(path)?;
            if plot.header().farmer_pubkey != config.farmer_pubkey {
                warn!(
                    "[farmer] plot {} belongs to another key; its proofs will not pay this farmer",
                    path.display()
                );
            }
        }
        let watchdog = Arc::new(Watchdog::new("farmer", metrics));
        watchdog.register("challenge_polls", Duration::from_secs(60));
        watchdog.register("scan_cycles", Duration::from_secs(120));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            config,
            client,
            plots,
            watchdog,
            last_submitted: None,
        })
    }

    pub fn plots(&self) -> &[PathBuf] {
        &self.plots
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    async fn fetch_challenge(&self) -> Result<ChallengeResponse, FarmerError> {
        let url = format!("{}/challenge", self.config.node_url);
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn submit(&self, proof: Proof, vdf: Option<&VdfInfo>) -> Result<SubmitBlockResponse, FarmerError> {
        let req = SubmitBlockRequest {
            farmer_pubkey_hex: proof.farmer_pubkey.to_hex(),
            proof,
            farmer_addr: self.config.farmer_addr,
            vdf_seed: vdf.map(|v| v.seed),
            vdf_iterations: vdf.map(|v| v.iterations),
            vdf_output: vdf.map(|v| v.output),
        };
        let url = format!("{}/submitBlock", self.config.node_url);
        let resp = self.client.post(url).json(&req).send().await?;
        Ok(resp.json().await?)
    }

    /// Poll `/challenge` until it differs from `current`
    async fn wait_for_change(&self, current: Hash) {
        let mut ticker = tokio::time::interval(self.config.preempt_check);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.fetch_challenge().await {
                Ok(c) if c.challenge != current => return,
                Ok(_) => self.watchdog.touch("challenge_polls"),
                Err(e) => debug!("[farmer] preempt poll failed: {}", e),
            }
        }
    }

    /// Run one cycle; returns the summary, or `None` if there was nothing to do
    pub async fn run_cycle(&mut self) -> Result<Option<CycleSummary>, FarmerError> {
        let challenge = self.fetch_challenge().await?;
        self.watchdog.touch("challenge_polls");
        if self.last_submitted == Some(challenge.challenge) {
            return Ok(None);
        }

        let cancel = CancelToken::new();
        let started = Instant::now();
        let scans = {
            let scan = scan_all(&self.plots, challenge.challenge, challenge.difficulty, &cancel);
            tokio::pin!(scan);
            tokio::select! {
                scans = &mut scan => scans,
                _ = self.wait_for_change(challenge.challenge) => {
                    debug!("[farmer] challenge changed at height {}, preempting", challenge.height);
                    cancel.cancel();
                    scan.await
                }
            }
        };
        self.watchdog.touch("scan_cycles");

        for (_, stats) in &scans {
            debug!(
                "[farmer] plot={} chunks={} elapsed_ms={} best={:?} threshold={} early_exit={} preempted={}",
                stats.plot, stats.chunks, stats.elapsed_ms, stats.best, stats.threshold, stats.early_exit, stats.preempted
            );
        }

        let (summary, winner) = CycleSummary::from_scans(
            challenge.height,
            challenge.vdf.map(|v| v.iterations),
            challenge.difficulty,
            started.elapsed().as_millis() as u64,
            &scans,
        );
        info!(
            "[farmer] cycle height={} vdf_iter={:?} plots={} elapsed_ms={} p50={} p95={} preempts={} best={:?} threshold={} early_exit={} winner={}",
            summary.height,
            summary.vdf_iter,
            summary.plots_scanned,
            summary.elapsed_ms,
            summary.p50,
            summary.p95,
            summary.preempts,
            summary.best_quality,
            summary.threshold,
            summary.early_exit,
            summary.winner
        );

        if let Some(proof) = winner.filter(|_| !cancel.is_cancelled()) {
            info!("[farmer] winning proof quality={} index={}", proof.quality, proof.index);
            match self.submit(proof, challenge.vdf.as_ref()).await {
                Ok(resp) if resp.status == "accepted" => {
                    info!("[farmer] block accepted at height {:?}", resp.height);
                    self.last_submitted = Some(challenge.challenge);
                }
                Ok(resp) => warn!("[farmer] block rejected: {}", resp.message),
                Err(e) => warn!("[farmer] submit failed: {}", e),
            }
        }
        Ok(Some(summary))
    }

    /// Farm until the task is dropped
    pub async fn run(mut self) {
        info!(
            "[farmer] farming {} plots for {} via {}",
            self.plots.len(),
            self.config.farmer_addr,
            self.config.node_url
        );
        let _checker = self.watchdog.clone().spawn();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_cycle().await {
                warn!("[farmer] cycle failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha256, PrivateKey};
    use crate::pospace::{generate_plot, verify_proof};

    fn key() -> PublicKey {
        PrivateKey::from_bytes(&[9u8; 32]).unwrap().public_key()
    }

    #[test]
    fn test_discovers_only_plot_files() {
        let dir = tempfile::tempdir().unwrap();
        generate_plot(&dir.path().join("b.arcv"), 4, key()).unwrap();
        generate_plot(&dir.path().join("a.arcv"), 4, key()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let plots = discover_plots(dir.path()).unwrap();
        assert_eq!(plots.len(), 2);
        assert!(plots[0].ends_with("a.arcv"));
    }

    #[tokio::test]
    async fn test_scan_all_finds_winner() {
        let dir = tempfile::tempdir().unwrap();
        generate_plot(&dir.path().join("a.arcv"), 5, key()).unwrap();
        generate_plot(&dir.path().join("b.arcv"), 5, key()).unwrap();
        std::fs::write(dir.path().join("broken.arcv"), b"nope").unwrap();
        let plots = discover_plots(dir.path()).unwrap();

        let challenge = sha256(b"farm");
        let scans = scan_all(&plots, challenge, u64::MAX, &CancelToken::new()).await;
        assert_eq!(scans.len(), 2);
        let (_, winner) = CycleSummary::from_scans(1, None, u64::MAX, 1, &scans);
        let proof = winner.unwrap();
        assert!(verify_proof(&proof, &challenge, u64::MAX).is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_scans_preempt() {
        let dir = tempfile::tempdir().unwrap();
        generate_plot(&dir.path().join("a.arcv"), 5, key()).unwrap();
        let plots = discover_plots(dir.path()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let scans = scan_all(&plots, sha256(b"x"), 0, &cancel).await;
        assert!(matches!(scans[0].0, ScanResult::Preempted));
    }

    #[test]
    fn test_empty_plot_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = FarmerConfig::new("http://127.0.0.1:1", dir.path(), key());
        let err = Farmer::new(config, Arc::new(Metrics::new())).unwrap_err();
        assert!(matches!(err, FarmerError::NoPlots(_)));
    }
}
