//! Counters and gauges exposed on `/metrics`

mod watchdog;

pub use watchdog::*;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter or settable gauge
#[derive(Debug, Default)]
pub struct Metric(AtomicU64);

impl Metric {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // saturating: never wraps below zero
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Node-wide metric registry
#[derive(Debug, Default)]
pub struct Metrics {
    pub submit_received: Metric,
    pub submit_accepted: Metric,
    pub submit_ignored: Metric,
    pub blocks_total: Metric,
    pub tip_height: Metric,
    pub difficulty: Metric,
    pub vdf_updates: Metric,
    pub peers: Metric,
    pub mempool_size: Metric,
    pub ibd_requested_batches: Metric,
    pub ibd_received_batches: Metric,
    pub ibd_blocks_applied: Metric,
    pub ibd_inflight: Metric,
    pub ibd_backoff_seconds: Metric,
    watchdog_triggered: Mutex<BTreeMap<(String, String), u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_watchdog_triggered(&self, group: &str, metric: &str, triggered: bool) {
        self.watchdog_triggered
            .lock()
            .insert((group.to_string(), metric.to_string()), triggered as u64);
    }

    pub fn watchdog_triggered(&self, group: &str, metric: &str) -> bool {
        self.watchdog_triggered
            .lock()
            .get(&(group.to_string(), metric.to_string()))
            .map_or(false, |v| *v == 1)
    }

    /// `(name, value)` for every counter and gauge
    pub fn values(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("archivas_submit_received_total", self.submit_received.get()),
            ("archivas_submit_accepted_total", self.submit_accepted.get()),
            ("archivas_submit_ignored_total", self.submit_ignored.get()),
            ("archivas_blocks_total", self.blocks_total.get()),
            ("archivas_tip_height", self.tip_height.get()),
            ("archivas_difficulty", self.difficulty.get()),
            ("archivas_vdf_updates_total", self.vdf_updates.get()),
            ("archivas_peers", self.peers.get()),
            ("archivas_mempool_size", self.mempool_size.get()),
            ("archivas_ibd_requested_batches_total", self.ibd_requested_batches.get()),
            ("archivas_ibd_received_batches_total", self.ibd_received_batches.get()),
            ("archivas_ibd_blocks_applied_total", self.ibd_blocks_applied.get()),
            ("archivas_ibd_inflight", self.ibd_inflight.get()),
            ("archivas_ibd_backoff_seconds_total", self.ibd_backoff_seconds.get()),
        ]
    }

    /// Plain `name value` lines
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.values() {
            let _ = writeln!(out, "{} {}", name, value);
        }
        for ((group, metric), value) in self.watchdog_triggered.lock().iter() {
            let _ = writeln!(
                out,
                "archivas_metrics_watchdog_triggered{{group=\"{}\",metric=\"{}\"}} {}",
                group, metric, value
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_ops() {
        let m = Metric::default();
        m.inc();
        m.add(4);
        assert_eq!(m.get(), 5);
        m.set(1);
        m.dec();
        m.dec();
        assert_eq!(m.get(), 0);
    }

    #[test]
    fn test_render_contains_names() {
        let metrics = Metrics::new();
        metrics.blocks_total.inc();
        metrics.set_watchdog_triggered("node", "archivas_tip_height", true);
        let text = metrics.render();
        assert!(text.contains("archivas_blocks_total 1"));
        assert!(text.contains(
            "archivas_metrics_watchdog_triggered{group=\"node\",metric=\"archivas_tip_height\"} 1"
        ));
    }
}
