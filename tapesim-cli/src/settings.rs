//! Layered configuration loading.
//!
//! Sources (lowest to highest precedence):
//! 1. `config/default.toml`
//! 2. `config/{environment}.toml` (if an environment is selected)
//! 3. `config/local.toml` (optional, ignored in git)
//! 4. Environment variables prefixed with `TAPESIM_` (nested keys split
//!    on `__`, e.g. `TAPESIM_DATASOURCE__KIND=sqlite`)
//!
//! Every key has a demo-friendly default, so the binary also runs with no
//! config directory at all.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use tapesim_core::TimeRep;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen_addr: Option<String>,
    pub metrics_addr: Option<String>,
    pub log_level: Option<String>,
    pub datasource: DataSourceConfig,
    /// Table whose time representation is negotiated at `init`.
    pub default_table: Option<String>,
    /// Per-table time representation overrides.
    pub tables: HashMap<String, TableTimeConfig>,
}

impl AppConfig {
    pub fn listen_addr(&self) -> &str {
        self.listen_addr.as_deref().unwrap_or("127.0.0.1:9300")
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

/// Which backend serves replay tables.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceKind {
    Sqlite,
    Csv,
    /// Deterministic in-memory demo table; no storage required.
    #[default]
    Demo,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    pub kind: DataSourceKind,
    /// Database file (sqlite) or table directory (csv).
    pub path: PathBuf,
    /// Default epoch unit for raw table timestamps.
    pub unit: String,
    /// Default IANA timezone for calendar arithmetic.
    pub timezone: String,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            kind: DataSourceKind::Demo,
            path: PathBuf::from("./data/replay.db"),
            unit: "ms".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

impl DataSourceConfig {
    pub fn time_rep(&self) -> Result<TimeRep> {
        TimeRep::parse(&self.unit, &self.timezone).map_err(anyhow::Error::msg)
    }
}

/// Per-table time representation.
#[derive(Clone, Debug, Deserialize)]
pub struct TableTimeConfig {
    pub unit: String,
    pub timezone: String,
}

impl TableTimeConfig {
    pub fn time_rep(&self) -> Result<TimeRep> {
        TimeRep::parse(&self.unit, &self.timezone).map_err(anyhow::Error::msg)
    }
}

/// Loads configuration by merging files and environment variables.
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("TAPESIM")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}
