//! Staleness watchdog
//!
//! Each group registers metrics with a threshold. A metric that is not
//! touched within its threshold raises its triggered gauge until touched
//! again.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::Metrics;

const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Entry {
    last_touch: Instant,
    threshold: Duration,
    triggered: bool,
}

/// One row of `/metrics/watchdogs`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WatchdogSnapshot {
    pub group: String,
    pub metric: String,
    pub seconds_since: f64,
    pub threshold_seconds: f64,
    pub triggered: bool,
}

/// Watchdog for one group (node, farmer, timelord)
#[derive(Debug)]
pub struct Watchdog {
    group: String,
    entries: Mutex<BTreeMap<String, Entry>>,
    metrics: Arc<Metrics>,
}

impl Watchdog {
    pub fn new(group: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            group: group.into(),
            entries: Mutex::new(BTreeMap::new()),
            metrics,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn register(&self, metric: &str, threshold: Duration) {
        self.entries.lock().insert(
            metric.to_string(),
            Entry {
                last_touch: Instant::now(),
                threshold,
                triggered: false,
            },
        );
        self.metrics.set_watchdog_triggered(&self.group, metric, false);
    }

    /// Mark `metric` as having advanced
    pub fn touch(&self, metric: &str) {
        if let Some(entry) = self.entries.lock().get_mut(metric) {
            entry.last_touch = Instant::now();
        }
    }

    /// Evaluate every entry at `now`; returns metrics whose state flipped
    pub fn check_at(&self, now: Instant) -> Vec<(String, bool)> {
        let mut flipped = Vec::new();
        let mut entries = self.entries.lock();
        for (metric, entry) in entries.iter_mut() {
            let stale = now.saturating_duration_since(entry.last_touch) > entry.threshold;
            if stale == entry.triggered {
                continue;
            }
            entry.triggered = stale;
            self.metrics.set_watchdog_triggered(&self.group, metric, stale);
            if stale {
                warn!(
                    "[watchdog] {}/{} stale for more than {:?}",
                    self.group, metric, entry.threshold
                );
            } else {
                info!("[watchdog] {}/{} recovered", self.group, metric);
            }
            flipped.push((metric.clone(), stale));
        }
        flipped
    }

    pub fn check(&self) -> Vec<(String, bool)> {
        self.check_at(Instant::now())
    }

    pub fn snapshot(&self) -> Vec<WatchdogSnapshot> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .map(|(metric, e)| WatchdogSnapshot {
                group: self.group.clone(),
                metric: metric.clone(),
                seconds_since: now.saturating_duration_since(e.last_touch).as_secs_f64(),
                threshold_seconds: e.threshold.as_secs_f64(),
                triggered: e.triggered,
            })
            .collect()
    }

    /// Checker period: half the smallest threshold, at least 5 s
    pub fn check_interval(&self) -> Duration {
        self.entries
            .lock()
            .values()
            .map(|e| e.threshold / 2)
            .min()
            .unwrap_or(MIN_CHECK_INTERVAL)
            .max(MIN_CHECK_INTERVAL)
    }

    /// Run the checker until the handle is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval());
            loop {
                ticker.tick().await;
                self.check();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_and_recover() {
        let metrics = Arc::new(Metrics::new());
        let dog = Watchdog::new("node", metrics.clone());
        dog.register("archivas_tip_height", Duration::from_secs(60));

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(dog.check_at(later), vec![("archivas_tip_height".to_string(), true)]);
        assert!(metrics.watchdog_triggered("node", "archivas_tip_height"));
        // no repeated transition
        assert!(dog.check_at(later).is_empty());

        dog.touch("archivas_tip_height");
        assert_eq!(
            dog.check_at(Instant::now()),
            vec![("archivas_tip_height".to_string(), false)]
        );
        assert!(!metrics.watchdog_triggered("node", "archivas_tip_height"));
    }

    #[test]
    fn test_check_interval_floor() {
        let dog = Watchdog::new("farmer", Arc::new(Metrics::new()));
        dog.register("a", Duration::from_secs(4));
        assert_eq!(dog.check_interval(), Duration::from_secs(5));
        let dog = Watchdog::new("farmer", Arc::new(Metrics::new()));
        dog.register("a", Duration::from_secs(120));
        assert_eq!(dog.check_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_snapshot() {
        let dog = Watchdog::new("timelord", Arc::new(Metrics::new()));
        dog.register("archivas_vdf_updates_total", Duration::from_secs(30));
        let snap = dog.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].group, "timelord");
        assert!(!snap[0].triggered);
        assert_eq!(snap[0].threshold_seconds, 30.0);
    }
}
