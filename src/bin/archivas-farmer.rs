//! Archivas farmer
//!
//! `plot` writes a new plot file; `farm` scans plots against a node's
//! challenge and submits winning proofs.

use archivas_core::crypto::{Address, PrivateKey};
use archivas_core::farmer::{Farmer, FarmerConfig};
use archivas_core::metrics::Metrics;
use archivas_core::pospace::generate_plot;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "archivas-farmer", about = "Archivas plotter and farmer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a plot of 2^k entries
    Plot {
        /// Output path (should end in .arcv)
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = 20)]
        k: u32,
        /// Farmer secp256k1 secret key, hex
        #[arg(long, env = "ARCHIVAS_FARMER_KEY")]
        farmer_key: String,
    },
    /// Farm every plot in a directory
    Farm {
        #[arg(long, default_value = "./plots")]
        plots: PathBuf,
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        node: String,
        #[arg(long, env = "ARCHIVAS_FARMER_KEY")]
        farmer_key: String,
        /// Reward address; defaults to the key's legacy address
        #[arg(long)]
        farmer_addr: Option<String>,
        /// Seconds between cycles
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("archivas_core=info")))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!("[farmer] {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Plot { path, k, farmer_key } => {
            let key = PrivateKey::from_hex(&farmer_key)?;
            let header = tokio::task::spawn_blocking(move || generate_plot(&path, k, key.public_key())).await??;
            info!("[farmer] plot ready: {} entries, plot_id {}", header.num_hashes, header.plot_id);
        }
        Command::Farm {
            plots,
            node,
            farmer_key,
            farmer_addr,
            interval,
        } => {
            let key = PrivateKey::from_hex(&farmer_key)?;
            let mut config = FarmerConfig::new(node, plots, key.public_key());
            if let Some(addr) = farmer_addr {
                config.farmer_addr = Address::parse(&addr)?;
            }
            config.poll_interval = Duration::from_secs(interval.max(1));
            let farmer = Farmer::new(config, Arc::new(Metrics::new()))?;
            tokio::select! {
                _ = farmer.run() => {}
                _ = tokio::signal::ctrl_c() => info!("[farmer] shutting down"),
            }
        }
    }
    Ok(())
}
