//! Configuration loading for the stash server.
//!
//! # Config File Locations
//!
//! Files are merged in order (later wins, field by field):
//! 1. `/etc/stash/config.toml` (system)
//! 2. `~/.config/stash/config.toml` (user)
//! 3. `./stash.toml`, or the path given with `--config`
//! 4. Environment variables (`STASH_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! storage_dir = "~/.local/share/stash"
//!
//! [bind]
//! listen = "0.0.0.0:8080"
//!
//! [public]
//! domain = "paste.example.org"
//! https = true
//!
//! [limits]
//! capacity = 1
//! refill_interval_secs = 5
//! max_upload_bytes = 67108864
//!
//! [store]
//! id_length = 6
//! sweep_interval_secs = 60
//!
//! [expiry]
//! default = "24h"
//!
//! [telemetry]
//! otlp_endpoint = "http://127.0.0.1:4317"
//! log_level = "info"
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};
pub use sections::{
    BindConfig, ExpiryConfig, LimitsConfig, PathsConfig, PublicConfig, StoreSection, TelemetryConfig,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value:?}")]
    Env { key: String, value: String },
}

/// Complete server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub public: PublicConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub expiry: ExpiryConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl StashConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load with an explicit file taking the place of `./stash.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load and report which files and variables contributed.
    pub fn load_with_sources_from(config_path: Option<&Path>) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::read_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources)?;

        Ok((config, sources))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> String {
        let body = toml::to_string_pretty(self).unwrap_or_else(|e| format!("# failed to render config: {e}\n"));
        format!("# stash configuration\n\n{body}")
    }
}
