//! slavesrv - Modbus TCP slave simulator
//!
//! Hosts one or more simulated Modbus slaves on a TCP endpoint. The protocol
//! engine lives in `voltage-slave`; this crate adds the CLI, configuration,
//! logging bootstrap, the accept loop and graceful shutdown.

pub mod bootstrap;
pub mod config;
pub mod logging;
pub mod server;
pub mod shutdown;

/// Unified Result type, anyhow at the service level
pub type Result<T> = anyhow::Result<T>;

/// Service information
pub const SERVICE_NAME: &str = "slavesrv";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/slavesrv.yaml";

pub use anyhow::{anyhow, bail, Context};
