//! Difficulty retargeting and chain work
//!
//! EMA retarget over the mean block spacing of the last window, clamped per
//! interval and floored at a minimum.

use serde::{Deserialize, Serialize};

use crate::constants::DIFFICULTY_PARAMS_ID;

/// Work contribution of one block
pub type WorkFn = fn(u64) -> u128;

/// Default work: the difficulty itself
pub fn default_work(difficulty: u64) -> u128 {
    difficulty as u128
}

/// Retarget parameters (normalized-qmax-1e12 set)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub initial_difficulty: u64,
    pub min_difficulty: u64,
    /// Blocks between retargets; 0 disables retargeting
    pub retarget_interval: u64,
    pub target_block_secs: u64,
    pub alpha: f64,
    pub max_decrease: f64,
    pub max_increase: f64,
    pub params_id: String,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            initial_difficulty: 1u64 << 50,
            min_difficulty: 10_000_000,
            retarget_interval: 10,
            target_block_secs: 20,
            alpha: 0.45,
            max_decrease: 0.30,
            max_increase: 1.25,
            params_id: DIFFICULTY_PARAMS_ID.to_string(),
        }
    }
}

impl ConsensusParams {
    /// Whether a retarget runs after accepting `height`
    pub fn retarget_due(&self, height: u64) -> bool {
        self.retarget_interval > 0 && height > 0 && height % self.retarget_interval == 0
    }
}

/// Mean spacing in whole seconds; 0 with fewer than two timestamps
pub fn observed_block_time(timestamps: &[i64]) -> u64 {
    if timestamps.len() < 2 {
        return 0;
    }
    let total: i64 = timestamps.windows(2).map(|w| w[1] - w[0]).sum();
    let avg = total / (timestamps.len() as i64 - 1);
    avg.max(0) as u64
}

/// Next difficulty from the current one and the observed spacing
pub fn retarget(current: u64, observed_secs: u64, params: &ConsensusParams) -> u64 {
    if observed_secs == 0 || params.target_block_secs == 0 {
        return current;
    }
    let cur = current as f64;
    let scale = observed_secs as f64 / params.target_block_secs as f64;
    let ideal = cur * scale;
    let smoothed = (1.0 - params.alpha) * cur + params.alpha * ideal;
    let bounded = smoothed
        .min(cur * params.max_increase)
        .max(cur * params.max_decrease);

    // `as` saturates out-of-range floats
    (bounded.round() as u64).max(params.min_difficulty)
}

/// Live difficulty and the work function used for fork choice
#[derive(Debug, Clone)]
pub struct Consensus {
    pub params: ConsensusParams,
    pub difficulty: u64,
    work: WorkFn,
}

impl Consensus {
    pub fn new(params: ConsensusParams) -> Self {
        Self {
            difficulty: params.initial_difficulty,
            params,
            work: default_work,
        }
    }

    /// Replace the work function (e.g. a 2^256/target form)
    pub fn with_work_fn(mut self, work: WorkFn) -> Self {
        self.work = work;
        self
    }

    pub fn work(&self, difficulty: u64) -> u128 {
        (self.work)(difficulty)
    }

    /// Cumulative work of a child of a block carrying `parent_work`
    pub fn cumulative_work(&self, parent_work: u128, difficulty: u64) -> u128 {
        parent_work.saturating_add(self.work(difficulty))
    }

    /// Retarget after accepting `height` given the last window of timestamps
    ///
    /// Returns the new difficulty when it changed.
    pub fn on_block_accepted(&mut self, height: u64, recent_timestamps: &[i64]) -> Option<u64> {
        if !self.params.retarget_due(height) {
            return None;
        }
        let observed = observed_block_time(recent_timestamps);
        let next = retarget(self.difficulty, observed, &self.params);
        if next == self.difficulty {
            return None;
        }
        self.difficulty = next;
        Some(next)
    }
}
