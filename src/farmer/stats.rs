//! Per-cycle scan summary

use serde::Serialize;

use crate::pospace::{PlotScanStats, Proof, ScanResult};

/// One farming cycle across all plots
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSummary {
    pub height: u64,
    pub vdf_iter: Option<u64>,
    pub plots_scanned: usize,
    pub elapsed_ms: u64,
    pub p50: u64,
    pub p95: u64,
    pub preempts: usize,
    pub best_quality: Option<u64>,
    pub threshold: u64,
    pub early_exit: bool,
    pub winner: bool,
}

/// Nearest-rank percentile over unsorted samples; 0 when empty
pub fn percentile(samples: &[u64], pct: f64) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

impl CycleSummary {
    /// Fold per-plot results into a summary and pick the proof to submit
    pub fn from_scans(
        height: u64,
        vdf_iter: Option<u64>,
        threshold: u64,
        elapsed_ms: u64,
        scans: &[(ScanResult, PlotScanStats)],
    ) -> (Self, Option<Proof>) {
        let times: Vec<u64> = scans.iter().map(|(_, s)| s.elapsed_ms).collect();
        let best = scans
            .iter()
            .filter_map(|(r, _)| r.best())
            .min_by_key(|p| p.quality)
            .cloned();
        let winner = best.clone().filter(|p| p.is_winner(threshold));

        let summary = Self {
            height,
            vdf_iter,
            plots_scanned: scans.len(),
            elapsed_ms,
            p50: percentile(&times, 50.0),
            p95: percentile(&times, 95.0),
            preempts: scans.iter().filter(|(_, s)| s.preempted).count(),
            best_quality: best.as_ref().map(|p| p.quality),
            threshold,
            early_exit: scans.iter().any(|(_, s)| s.early_exit),
            winner: winner.is_some(),
        };
        (summary, winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha256, PrivateKey};

    fn stats(elapsed_ms: u64, preempted: bool) -> PlotScanStats {
        PlotScanStats {
            plot: "p.arcv".into(),
            chunks: 1,
            elapsed_ms,
            best: None,
            threshold: 10,
            early_exit: false,
            preempted,
        }
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(&[], 50.0), 0);
        assert_eq!(percentile(&[7], 95.0), 7);
        let samples: Vec<u64> = (1..=100).rev().collect();
        assert_eq!(percentile(&samples, 50.0), 50);
        assert_eq!(percentile(&samples, 95.0), 95);
    }

    #[test]
    fn test_summary_picks_lowest_quality() {
        let key = PrivateKey::from_bytes(&[3u8; 32]).unwrap().public_key();
        let challenge = sha256(b"cycle");
        let a = Proof::from_entry(challenge, key, 1);
        let b = Proof::from_entry(challenge, key, 2);
        let (lo, hi) = if a.quality < b.quality { (a, b) } else { (b, a) };

        let scans = vec![
            (ScanResult::NoWinner(Some(hi)), stats(10, false)),
            (ScanResult::NoWinner(Some(lo.clone())), stats(30, false)),
            (ScanResult::Preempted, stats(20, true)),
        ];

        let (summary, winner) = CycleSummary::from_scans(5, Some(900), 0, 40, &scans);
        assert!(winner.is_none());
        assert_eq!(summary.best_quality, Some(lo.quality));
        assert_eq!(summary.preempts, 1);
        assert_eq!(summary.p50, 20);
        assert_eq!(summary.plots_scanned, 3);

        let (summary, winner) = CycleSummary::from_scans(5, None, u64::MAX, 40, &scans);
        assert_eq!(winner, Some(lo));
        assert!(summary.winner);
    }
}
