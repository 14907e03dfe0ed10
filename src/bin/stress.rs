//! Binary entry point for the concurrent stress simulation
//! Run with: cargo run --bin stress

use anyhow::Result;
use market_engine::sim::{self, SimConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info,market_engine=debug")
        .init();

    let config = SimConfig::from_env();
    sim::run(config).await
}
