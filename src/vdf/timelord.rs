//! Timelord: advances the VDF for the current tip and reports to the node

use std::time::Duration;
use tracing::{debug, info, warn};

use super::engine::{iterate, seed_for_tip, VdfState, CHECKPOINT_STEP};
use crate::crypto::Hash;
use crate::rpc::types::ChainTipResponse;

/// Iterations per tick
pub const DEFAULT_STEP_SIZE: u64 = 500;

/// Timelord loop settings
#[derive(Debug, Clone)]
pub struct TimelordConfig {
    /// Node RPC base URL, e.g. `http://127.0.0.1:8080`
    pub node_url: String,
    pub step_size: u64,
    pub tick: Duration,
}

impl Default for TimelordConfig {
    fn default() -> Self {
        Self {
            node_url: "http://127.0.0.1:8080".to_string(),
            step_size: DEFAULT_STEP_SIZE,
            tick: Duration::from_secs(1),
        }
    }
}

/// VDF progress for one tip
#[derive(Debug, Clone)]
pub struct Timelord {
    state: VdfState,
    checkpoints: Vec<(u64, Hash)>,
}

impl Timelord {
    pub fn new(seed: Hash) -> Self {
        Self {
            state: VdfState::at_seed(seed),
            checkpoints: Vec::new(),
        }
    }

    pub fn state(&self) -> &VdfState {
        &self.state
    }

    /// Snapshots taken every `CHECKPOINT_STEP` iterations for the current seed
    pub fn checkpoints(&self) -> &[(u64, Hash)] {
        &self.checkpoints
    }

    /// Track a new tip; returns true if the seed changed and state was reset
    pub fn observe_tip(&mut self, tip_hash: &Hash, tip_height: u64) -> bool {
        let seed = seed_for_tip(tip_hash, tip_height);
        if seed == self.state.seed {
            return false;
        }
        self.state = VdfState::at_seed(seed);
        self.checkpoints.clear();
        true
    }

    /// Continue `steps` iterations from the current output
    pub fn advance(&mut self, steps: u64) -> VdfState {
        let mut remaining = steps;
        while remaining > 0 {
            let to_boundary = CHECKPOINT_STEP - self.state.iterations % CHECKPOINT_STEP;
            let n = remaining.min(to_boundary);
            self.state.output = iterate(self.state.output, n);
            self.state.iterations += n;
            remaining -= n;
            if self.state.iterations % CHECKPOINT_STEP == 0 {
                self.checkpoints.push((self.state.iterations, self.state.output));
            }
        }
        self.state
    }
}

/// Poll the tip, tick the VDF and post updates until the task is dropped
pub async fn run_timelord(config: TimelordConfig) {
    let client = reqwest::Client::new();
    let mut timelord = Timelord::new(Hash::zero());
    let mut ticker = tokio::time::interval(config.tick);
    let tip_url = format!("{}/chainTip", config.node_url);
    let update_url = format!("{}/vdf/update", config.node_url);

    info!("[timelord] started node={} step={}", config.node_url, config.step_size);

    loop {
        ticker.tick().await;

        let tip = match fetch_tip(&client, &tip_url).await {
            Ok(tip) => tip,
            Err(e) => {
                warn!("[timelord] chainTip failed: {}", e);
                continue;
            }
        };
        if timelord.observe_tip(&tip.block_hash, tip.height) {
            info!(
                "[timelord] new tip height={} seed={}",
                tip.height,
                &timelord.state().seed.to_hex()[..16]
            );
        }

        let state = timelord.advance(config.step_size);
        match client.post(&update_url).json(&state).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("[timelord] posted iter={}", state.iterations);
            }
            Ok(resp) => warn!("[timelord] update rejected: {}", resp.status()),
            Err(e) => warn!("[timelord] update failed: {}", e),
        }
    }
}

async fn fetch_tip(client: &reqwest::Client, url: &str) -> Result<ChainTipResponse, reqwest::Error> {
    client.get(url).send().await?.error_for_status()?.json().await
}
