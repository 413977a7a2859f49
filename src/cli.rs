//! Command-line interface.
//!
//! Every command opens the devices it needs through a shared
//! [`ConnectionRegistry`] and returns its output as text, so `main` only
//! prints and shuts down.

use crate::config::BenchConfig;
use anyhow::{anyhow, Context, Result};
use bench_drivers::{FgSource, PowerMaster8121, RefMeter};
use clap::{Parser, Subcommand};
use regex::Regex;
use serial_proxy::{
    ConnectionRegistry, LogSource, LogSourceKind, Matcher, SerialPortExecutor, SerialPortRequest,
    TracingInterfaceLogger,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "meter-bench")]
#[command(about = "Meter test bench control over shared serial lines", long_about = None)]
pub struct Cli {
    /// Bench configuration file
    #[arg(long, default_value = "config/bench.toml")]
    pub config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    pub log_level: Option<String>,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Bench commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List configured devices
    Devices,

    /// Send one command line and print the reply
    Query {
        /// Device id from the configuration
        device: String,
        /// Command line to send
        command: String,
        /// Terminal reply line
        #[arg(long, conflicts_with = "regex")]
        until: Option<String>,
        /// Terminal reply pattern
        #[arg(long)]
        regex: Option<String>,
        /// Reply timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Read the ZIF socket firmware version
    ZifVersion {
        /// Device id from the configuration
        device: String,
    },

    /// Read reference meter actual values as JSON
    ActualValues {
        /// Device id from the configuration
        device: String,
    },

    /// Read the source dosage progress as JSON
    DosageProgress {
        /// Device id from the configuration
        device: String,
    },
}

fn executor(
    config: &BenchConfig,
    registry: &ConnectionRegistry,
    device: &str,
    kind: LogSourceKind,
) -> Result<SerialPortExecutor> {
    let port = config.device(device)?;
    let connection = registry
        .get_or_open(device, port)
        .with_context(|| format!("Failed to open device '{}'", device))?;
    let source = LogSource::new(kind, connection.endpoint());
    Ok(connection.create_executor(source, Arc::new(TracingInterfaceLogger)))
}

/// Run one command and return what should be printed.
pub async fn run(command: Command, config: &BenchConfig, registry: &ConnectionRegistry) -> Result<String> {
    match command {
        Command::Devices => Ok(config
            .devices
            .iter()
            .map(|(id, port)| {
                let endpoint = port.endpoint.as_deref().unwrap_or("-");
                format!("{}\t{}\t{}", id, port.kind.as_str(), endpoint)
            })
            .collect::<Vec<_>>()
            .join("\n")),

        Command::Query {
            device,
            command,
            until,
            regex,
            timeout_ms,
        } => {
            let end = match (until, regex) {
                (_, Some(pattern)) => Matcher::from(
                    Regex::new(&pattern).with_context(|| format!("Invalid pattern '{}'", pattern))?,
                ),
                (Some(line), None) => Matcher::from(line),
                (None, None) => return Err(anyhow!("Either --until or --regex is required")),
            };
            let mut request = SerialPortRequest::create(command, end);
            if let Some(ms) = timeout_ms {
                request = request.with_timeout(Duration::from_millis(ms));
            }

            let executor = executor(config, registry, &device, LogSourceKind::MeterTestSystem)?;
            let handle = executor
                .execute(vec![request])
                .pop()
                .ok_or_else(|| anyhow!("No reply handle"))?;
            let reply = handle.await.context("Query failed")?;
            Ok(reply.lines.join("\n"))
        }

        Command::ZifVersion { device } => {
            let executor = executor(config, registry, &device, LogSourceKind::Zif)?;
            let version = PowerMaster8121::new(executor).version().await?;
            Ok(format!("{}.{}", version.major, version.minor))
        }

        Command::ActualValues { device } => {
            let executor = executor(config, registry, &device, LogSourceKind::RefMeter)?;
            let values = RefMeter::new(executor).actual_values().await?;
            Ok(serde_json::to_string_pretty(&values)?)
        }

        Command::DosageProgress { device } => {
            let executor = executor(config, registry, &device, LogSourceKind::Source)?;
            let progress = FgSource::new(executor).dosage_progress().await?;
            Ok(serde_json::to_string_pretty(&progress)?)
        }
    }
}
