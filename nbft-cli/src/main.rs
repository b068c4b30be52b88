//! NBFT round driver CLI
//!
//! Runs one consensus round over the in-process bus and prints the
//! decision as JSON. Exits zero on any completed round, with or without
//! consensus; only infrastructure failures produce a non-zero status.

use anyhow::Context;
use clap::Parser;
use nbft_consensus::{MemoryBus, NbftConfig, RoundDriver};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nbft", version, about = "Hierarchical BFT consensus round driver")]
struct Args {
    /// Total number of nodes in the network
    #[arg(long, default_value_t = 16)]
    nodes: usize,

    /// Nodes per consensus group
    #[arg(long, default_value_t = 4)]
    group_size: usize,

    /// View number, rotates group assignment and representative selection
    #[arg(long, default_value_t = 0)]
    view: u64,

    /// Dishonest nodes to inject, sampled uniformly at random
    #[arg(long, default_value_t = 0)]
    malicious: usize,

    /// Payload to propose
    #[arg(long, default_value = "BLOCK_HASH_ABC")]
    value: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = NbftConfig::new(args.nodes, args.group_size);
    cfg.view = args.view;
    cfg.mal_nodes = args.malicious;

    let driver = RoundDriver::new(cfg, MemoryBus::shared());
    let decision = driver
        .run(1, &args.value)
        .await
        .context("consensus round failed")?;

    if decision.consensus {
        info!(winner = %decision.winner, votes = decision.votes, "Consensus reached");
    } else {
        warn!(
            total = decision.total,
            threshold = decision.threshold,
            "Consensus not reached"
        );
    }
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}
