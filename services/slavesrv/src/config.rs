//! slavesrv configuration
//!
//! Loaded in three layers, later ones winning: built-in defaults, the YAML
//! file, then `SLAVESRV_` environment variables (`__` separates nesting,
//! e.g. `SLAVESRV_SERVICE__BIND_ADDRESS`).

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use voltage_slave::constants::{DEFAULT_READ_BUFFER_SIZE, MAX_UNIT_ID};
use voltage_slave::{BitTable, PointStore, PointType, RegisterTable, StoreLayout};

use crate::Result;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SLAVESRV_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlavesrvConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub slaves: Vec<SlaveConfig>,
}

/// Network endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Peers allowed to connect; empty accepts everyone
    #[serde(default)]
    pub allowed_clients: Vec<IpAddr>,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            allowed_clients: Vec::new(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_true")]
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            ansi: true,
        }
    }
}

/// One simulated slave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    pub unit_id: u8,
    #[serde(default)]
    pub layout: StoreLayout,
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Initial point values, written before the listener opens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub coils: Vec<SeedRange<bool>>,
    #[serde(default)]
    pub discrete_inputs: Vec<SeedRange<bool>>,
    #[serde(default)]
    pub holding_registers: Vec<SeedRange<u16>>,
    #[serde(default)]
    pub input_registers: Vec<SeedRange<u16>>,
}

/// Consecutive values starting at `address`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRange<T> {
    pub address: u16,
    pub values: Vec<T>,
}

impl<T> SeedRange<T> {
    fn end(&self) -> usize {
        self.address as usize + self.values.len()
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:502".to_string()
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl SlavesrvConfig {
    /// Layered provider chain for `path`
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(SlavesrvConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from a YAML file plus environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Configuration file not found: {}", path.display());
        }
        Self::figment(path)
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.service
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.service.bind_address))
    }

    /// Reject configurations the server cannot start with
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;

        if self.service.read_buffer_size == 0 {
            bail!("service.read_buffer_size must be greater than 0");
        }

        if self.slaves.is_empty() {
            bail!("At least one slave must be configured");
        }

        let mut seen = HashSet::new();
        for slave in &self.slaves {
            if slave.unit_id == 0 || slave.unit_id > MAX_UNIT_ID {
                bail!(
                    "Slave unit id {} out of range 1..={}",
                    slave.unit_id,
                    MAX_UNIT_ID
                );
            }
            if !seen.insert(slave.unit_id) {
                bail!("Duplicate slave unit id {}", slave.unit_id);
            }
            slave
                .validate()
                .with_context(|| format!("Slave {} is invalid", slave.unit_id))?;
        }

        Ok(())
    }
}

impl SlaveConfig {
    pub fn validate(&self) -> Result<()> {
        self.layout.validate()?;

        check_seeds(&self.layout, PointType::Coils, &self.seed.coils)?;
        check_seeds(
            &self.layout,
            PointType::DiscreteInputs,
            &self.seed.discrete_inputs,
        )?;
        check_seeds(
            &self.layout,
            PointType::HoldingRegisters,
            &self.seed.holding_registers,
        )?;
        check_seeds(
            &self.layout,
            PointType::InputRegisters,
            &self.seed.input_registers,
        )?;
        Ok(())
    }

    /// Allocate the store and write the seed values
    pub fn build_store(&self) -> Result<Arc<PointStore>> {
        let store = PointStore::new(self.layout)?;

        for range in &self.seed.coils {
            store.write_bits(BitTable::Coils, range.address, &range.values)?;
        }
        for range in &self.seed.discrete_inputs {
            store.write_bits(BitTable::DiscreteInputs, range.address, &range.values)?;
        }
        for range in &self.seed.holding_registers {
            store.write_registers(
                RegisterTable::HoldingRegisters,
                range.address,
                &range.values,
            )?;
        }
        for range in &self.seed.input_registers {
            store.write_registers(RegisterTable::InputRegisters, range.address, &range.values)?;
        }

        Ok(Arc::new(store))
    }
}

fn check_seeds<T>(
    layout: &StoreLayout,
    point_type: PointType,
    ranges: &[SeedRange<T>],
) -> Result<()> {
    let size = layout.size_of(point_type);
    for range in ranges {
        if range.end() > size {
            bail!(
                "{} seed at {} with {} values exceeds table size {}",
                point_type,
                range.address,
                range.values.len(),
                size
            );
        }
    }
    Ok(())
}
