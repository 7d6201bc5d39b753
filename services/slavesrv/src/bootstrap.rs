//! Command-line arguments and startup overrides

use std::path::PathBuf;

use clap::Parser;

use crate::config::SlavesrvConfig;
use crate::DEFAULT_CONFIG_PATH;

/// slavesrv startup arguments
#[derive(Debug, Clone, Parser)]
#[clap(author, version, about = "Modbus TCP slave simulator")]
pub struct Args {
    /// Configuration file (YAML)
    #[clap(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Bind address override (e.g., 127.0.0.1:1502)
    #[clap(short = 'b', long, env = "BIND_ADDRESS")]
    pub bind: Option<String>,

    /// Log level override (trace, debug, info, warn, error)
    #[clap(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output (useful for log files)
    #[clap(long)]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[clap(long)]
    pub validate: bool,
}

impl Args {
    /// Apply CLI overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut SlavesrvConfig) {
        if let Some(bind) = &self.bind {
            config.service.bind_address = bind.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.no_color {
            config.logging.ansi = false;
        }
    }
}

/// Parse a log level string, falling back to INFO like the other services
pub fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
