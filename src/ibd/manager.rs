//! HTTP IBD driver

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::{IbdConfig, IbdError, IbdState};
use crate::node::BlockImporter;
use crate::rpc::types::{BlocksRangeResponse, ChainTipResponse};

/// Pulls blocks from peers' `/blocks/range` until the gap is small
pub struct IbdManager {
    config: IbdConfig,
    importer: Arc<dyn BlockImporter>,
    client: reqwest::Client,
}

impl std::fmt::Debug for IbdManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IbdManager").field("config", &self.config).finish()
    }
}

impl IbdManager {
    pub fn new(config: IbdConfig, importer: Arc<dyn BlockImporter>) -> Result<Self, IbdError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IbdError::Fatal(format!("http client: {}", e)))?;
        Ok(Self {
            config,
            importer,
            client,
        })
    }

    /// Try each peer in turn until one brings us within the catch-up threshold
    pub async fn run_with_peers(&self, urls: &[String]) -> Result<(), IbdError> {
        if urls.is_empty() {
            return Ok(());
        }
        if let Some(prev) = IbdState::load(&self.config.state_file).filter(|s| s.in_progress) {
            info!(
                "[ibd] resuming interrupted sync from {} ({:.1}% of {})",
                prev.peer_url,
                prev.progress(),
                prev.target_height
            );
        }
        for url in urls {
            let url = url.trim_end_matches('/');
            match self.sync_from(url).await {
                Ok(()) => {
                    if let Err(e) = IbdState::clear(&self.config.state_file) {
                        warn!("[ibd] could not clear state file: {}", e);
                    }
                    return Ok(());
                }
                Err(e) => warn!("[ibd] peer {} failed: {}", url, e),
            }
        }
        Err(IbdError::Fatal(format!("all {} peers exhausted", urls.len())))
    }

    async fn sync_from(&self, url: &str) -> Result<(), IbdError> {
        let tip: ChainTipResponse = self.get_with_retry(&format!("{}/chainTip", url)).await?;
        let start = self.importer.local_height();
        if tip.height <= start || tip.height - start < self.config.ibd_threshold {
            info!("[ibd] {} at {} vs local {}, no IBD needed", url, tip.height, start);
            return Ok(());
        }
        info!("[ibd] syncing from {}: local {} -> target {}", url, start, tip.height);

        let mut state = IbdState {
            in_progress: true,
            start_height: start,
            current_height: start,
            target_height: tip.height,
            peer_url: url.to_string(),
            started_at: unix_now(),
        };
        let started = Instant::now();
        let mut last_progress = Instant::now();

        loop {
            let local = self.importer.local_height();
            if state.target_height.saturating_sub(local) <= self.config.catch_up_threshold {
                break;
            }
            let range_url = format!(
                "{}/blocks/range?from={}&limit={}",
                url,
                local + 1,
                self.config.batch_size
            );
            let batch: BlocksRangeResponse = self.get_with_retry(&range_url).await?;
            state.target_height = state.target_height.max(batch.tip);
            if batch.blocks.is_empty() {
                debug!("[ibd] {} returned no blocks from {}", url, local + 1);
                break;
            }
            let importer = self.importer.clone();
            tokio::task::spawn_blocking(move || {
                for block in batch.blocks {
                    if block.height <= importer.local_height() {
                        continue;
                    }
                    let height = block.height;
                    importer
                        .apply_peer_block(block)
                        .map_err(|e| IbdError::Retryable(format!("block {} rejected: {}", height, e)))?;
                }
                Ok::<(), IbdError>(())
            })
            .await
            .map_err(|e| IbdError::Retryable(format!("import task failed: {}", e)))??;

            state.current_height = self.importer.local_height();
            if let Err(e) = state.save(&self.config.state_file) {
                warn!("[ibd] could not save state: {}", e);
            }
            if last_progress.elapsed() >= self.config.progress_interval {
                log_progress(&state, started.elapsed());
                last_progress = Instant::now();
            }
        }

        let done = self.importer.local_height();
        info!(
            "[ibd] complete: {} blocks in {:.1}s, height {}",
            done.saturating_sub(start),
            started.elapsed().as_secs_f64(),
            done
        );
        Ok(())
    }

    /// GET and decode JSON, retrying with `retry_delay × attempt`
    async fn get_with_retry<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, IbdError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.get_json(url).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= self.config.max_retries => {
                    return Err(IbdError::Retryable(format!(
                        "{} failed after {} attempts: {}",
                        url, attempt, e
                    )))
                }
                Err(e) => {
                    let delay = self.config.retry_delay * attempt;
                    debug!("[ibd] {} attempt {} failed: {}, retrying in {:?}", url, attempt, e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, IbdError> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }
}

fn log_progress(state: &IbdState, elapsed: Duration) {
    let done = state.current_height.saturating_sub(state.start_height);
    let rate = done as f64 / elapsed.as_secs_f64().max(0.001);
    let remaining = state.target_height.saturating_sub(state.current_height);
    let eta = if rate > 0.0 { remaining as f64 / rate } else { 0.0 };
    info!(
        "[ibd] {:.1}% height {}/{} rate {:.1} blocks/s eta {:.0}s",
        state.progress(),
        state.current_height,
        state.target_height,
        rate,
        eta
    );
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}
