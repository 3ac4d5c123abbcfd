//! BT1120 capture simulator - entry point

use anyhow::Context;
use bt1120_sim::{init_logging, run, SimConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1);
    let config = SimConfig::load(path.as_deref()).context("loading simulator config")?;
    init_logging(config.log_json);

    info!("=== BT1120 capture simulator v{} ===", env!("CARGO_PKG_VERSION"));
    let report = run(&config).await.context("simulation failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
