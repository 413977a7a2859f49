//! `meter_bench`
//!
//! Bench-level wiring for the meter test bench: configuration loading,
//! tracing setup and the `meter-bench` command line. The serial multiplexer
//! lives in [`serial_proxy`], the device clients in [`bench_drivers`].
//!
//! # Modules
//!
//! - [`config`]: figment-based bench configuration (TOML plus environment)
//! - [`logging`]: `tracing-subscriber` initialisation
//! - [`cli`]: clap command definitions and their execution

pub mod cli;
pub mod config;
pub mod logging;

pub use config::{ApplicationConfig, BenchConfig, BenchConfigError, LogFormat};
