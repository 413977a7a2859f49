//! CLI Entry Point for meter-bench
//!
//! # Usage
//!
//! ```bash
//! meter-bench --config config/bench.toml devices
//! meter-bench query refmeter AAV --until AAVACK
//! meter-bench actual-values refmeter
//! meter-bench zif-version zif
//! ```

use anyhow::Result;
use clap::Parser;
use meter_bench::cli::{self, Cli};
use meter_bench::config::BenchConfig;
use meter_bench::logging;
use serial_proxy::ConnectionRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BenchConfig::load_from(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    logging::init_from_config(&config)?;

    let registry = ConnectionRegistry::new();
    let result = cli::run(cli.command, &config, &registry).await;
    registry.close_all().await;

    println!("{}", result?);
    Ok(())
}
