//! Archivas timelord
//!
//! Follows the node's tip and posts VDF progress to `/vdf/update`.

use archivas_core::vdf::{run_timelord, TimelordConfig, DEFAULT_STEP_SIZE};
use clap::Parser;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "archivas-timelord", about = "Archivas VDF timelord")]
struct Cli {
    /// Node RPC base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    node: String,
    /// Iterations per tick
    #[arg(long, default_value_t = DEFAULT_STEP_SIZE)]
    step: u64,
    /// Milliseconds between ticks
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("archivas_core=info")))
        .init();

    let cli = Cli::parse();
    let config = TimelordConfig {
        node_url: cli.node.trim_end_matches('/').to_string(),
        step_size: cli.step.max(1),
        tick: Duration::from_millis(cli.tick_ms.max(10)),
    };
    tokio::select! {
        _ = run_timelord(config) => {}
        _ = tokio::signal::ctrl_c() => info!("[timelord] shutting down"),
    }
}
