//! Plot scanning with early exit and cooperative preemption

use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::plot::{PlotError, PlotFile, ENTRY_SIZE};
use super::proof::{quality, Proof};
use crate::crypto::Hash;

/// Per-cycle cancel flag shared by every scan of that cycle
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every scan holding this token to stop at its next chunk boundary
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag for reuse
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Outcome of scanning one plot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// First entry whose quality beats the difficulty
    Winner(Proof),
    /// Full scan, nothing beat the difficulty; best entry kept for logging
    NoWinner(Option<Proof>),
    /// Abandoned because the challenge changed
    Preempted,
}

impl ScanResult {
    pub fn winner(&self) -> Option<&Proof> {
        match self {
            ScanResult::Winner(p) => Some(p),
            _ => None,
        }
    }

    /// Best proof seen, winning or not
    pub fn best(&self) -> Option<&Proof> {
        match self {
            ScanResult::Winner(p) => Some(p),
            ScanResult::NoWinner(best) => best.as_ref(),
            ScanResult::Preempted => None,
        }
    }
}

/// Per-plot scan statistics
#[derive(Debug, Clone, Serialize)]
pub struct PlotScanStats {
    pub plot: String,
    pub chunks: u64,
    pub elapsed_ms: u64,
    pub best: Option<u64>,
    pub threshold: u64,
    pub early_exit: bool,
    pub preempted: bool,
}

/// Scan an open plot for `challenge`, stopping early on the first winner
pub fn scan_plot(
    plot: &mut PlotFile,
    challenge: &Hash,
    difficulty: u64,
    cancel: &CancelToken,
) -> Result<(ScanResult, PlotScanStats), PlotError> {
    let started = Instant::now();
    let header = plot.header().clone();
    let mut stats = PlotScanStats {
        plot: plot.path().display().to_string(),
        chunks: 0,
        elapsed_ms: 0,
        best: None,
        threshold: difficulty,
        early_exit: false,
        preempted: false,
    };

    plot.rewind_entries()?;
    let mut buf = Vec::new();
    let mut next_index = 0u64;
    let mut best: Option<(u64, u64, Hash)> = None;

    let result = loop {
        if cancel.is_cancelled() {
            stats.preempted = true;
            break ScanResult::Preempted;
        }
        let remaining = header.num_hashes - next_index;
        if remaining == 0 {
            break ScanResult::NoWinner(best.map(|(index, _, hash)| {
                build_proof(challenge, &header.farmer_pubkey, header.plot_id, index, hash)
            }));
        }

        let count = plot.read_chunk(&mut buf, remaining)?;
        stats.chunks += 1;

        let mut winner = None;
        for (offset, raw) in buf.chunks_exact(ENTRY_SIZE).enumerate() {
            let mut entry = [0u8; 32];
            entry.copy_from_slice(raw);
            let hash = Hash(entry);
            let q = quality(challenge, &hash);
            let index = next_index + offset as u64;
            if best.map_or(true, |(_, b, _)| q < b) {
                best = Some((index, q, hash));
            }
            if q < difficulty {
                winner = Some((index, hash));
                break;
            }
        }
        next_index += count as u64;

        if let Some((index, hash)) = winner {
            stats.early_exit = true;
            break ScanResult::Winner(build_proof(
                challenge,
                &header.farmer_pubkey,
                header.plot_id,
                index,
                hash,
            ));
        }
    };

    stats.best = best.map(|(_, q, _)| q);
    stats.elapsed_ms = started.elapsed().as_millis() as u64;
    Ok((result, stats))
}

fn build_proof(
    challenge: &Hash,
    farmer_pubkey: &crate::crypto::PublicKey,
    plot_id: Hash,
    index: u64,
    hash: Hash,
) -> Proof {
    Proof {
        challenge: *challenge,
        plot_id,
        farmer_pubkey: *farmer_pubkey,
        index,
        hash,
        quality: quality(challenge, &hash),
    }
}

/// Open `path` and return the first winning proof, or the best-quality
/// proof when nothing wins. Callers compare `quality < difficulty`.
pub fn check_challenge(
    path: &Path,
    challenge: &Hash,
    difficulty: u64,
) -> Result<Option<Proof>, PlotError> {
    let mut plot = PlotFile::open(path)?;
    let (result, _) = scan_plot(&mut plot, challenge, difficulty, &CancelToken::new())?;
    Ok(result.best().cloned())
}
