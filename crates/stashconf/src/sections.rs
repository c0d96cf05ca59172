//! Config sections. Every field has a compiled default so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Where objects and their policy records live.
    /// Default: ~/.local/share/stash
    #[serde(default = "PathsConfig::default_storage_dir")]
    pub storage_dir: PathBuf,
}

impl PathsConfig {
    fn default_storage_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.data_dir().join("stash"))
            .unwrap_or_else(|| PathBuf::from("static"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            storage_dir: Self::default_storage_dir(),
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindConfig {
    /// Default: 0.0.0.0:8080
    #[serde(default = "BindConfig::default_listen")]
    pub listen: String,
}

impl BindConfig {
    fn default_listen() -> String {
        "0.0.0.0:8080".to_string()
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
        }
    }
}

/// How the service describes itself in generated URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicConfig {
    /// Host (and optional port) placed in returned URLs.
    /// Default: localhost:8080
    #[serde(default = "PublicConfig::default_domain")]
    pub domain: String,

    /// Emit `https://` instead of `http://`.
    #[serde(default)]
    pub https: bool,
}

impl PublicConfig {
    fn default_domain() -> String {
        "localhost:8080".to_string()
    }

    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    /// `<scheme>://<domain>`
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.domain)
    }
}

impl Default for PublicConfig {
    fn default() -> Self {
        Self {
            domain: Self::default_domain(),
            https: false,
        }
    }
}

/// Admission control and request size limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Burst size per client.
    #[serde(default = "LimitsConfig::default_capacity")]
    pub capacity: u32,

    /// Seconds to earn back one request.
    #[serde(default = "LimitsConfig::default_refill_interval_secs")]
    pub refill_interval_secs: u64,

    /// Upper bound on tracked clients.
    #[serde(default = "LimitsConfig::default_max_clients")]
    pub max_clients: usize,

    /// Idle time after which a client's state is forgotten.
    #[serde(default = "LimitsConfig::default_client_idle_secs")]
    pub client_idle_secs: u64,

    /// Largest accepted request body.
    /// Default: 64 MiB
    #[serde(default = "LimitsConfig::default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl LimitsConfig {
    fn default_capacity() -> u32 {
        1
    }

    fn default_refill_interval_secs() -> u64 {
        5
    }

    fn default_max_clients() -> usize {
        100_000
    }

    fn default_client_idle_secs() -> u64 {
        600
    }

    fn default_max_upload_bytes() -> usize {
        64 * 1024 * 1024
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
            refill_interval_secs: Self::default_refill_interval_secs(),
            max_clients: Self::default_max_clients(),
            client_idle_secs: Self::default_client_idle_secs(),
            max_upload_bytes: Self::default_max_upload_bytes(),
        }
    }
}

/// Store tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSection {
    /// Characters per generated id.
    #[serde(default = "StoreSection::default_id_length")]
    pub id_length: usize,

    /// Refuse to serve objects whose policy record cannot be decoded.
    #[serde(default)]
    pub strict_metadata: bool,

    /// Seconds between janitor passes.
    #[serde(default = "StoreSection::default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Age at which staging leftovers and orphaned records are reclaimed.
    #[serde(default = "StoreSection::default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
}

impl StoreSection {
    fn default_id_length() -> usize {
        6
    }

    fn default_sweep_interval_secs() -> u64 {
        60
    }

    fn default_orphan_grace_secs() -> u64 {
        3600
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            id_length: Self::default_id_length(),
            strict_metadata: false,
            sweep_interval_secs: Self::default_sweep_interval_secs(),
            orphan_grace_secs: Self::default_orphan_grace_secs(),
        }
    }
}

/// Policy applied when an upload names no expiry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryConfig {
    /// A selector: `""`/`"0"` never, `"view"`, or a duration like `"24h"`.
    #[serde(default)]
    pub default: String,
}

/// Telemetry and observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint. Export is disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,

    /// Filter directive (trace, debug, info, warn, error, or a full `EnvFilter`).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: Self::default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_default() {
        let paths = PathsConfig::default();
        assert!(paths.storage_dir.to_string_lossy().contains("stash")
            || paths.storage_dir == PathBuf::from("static"));
    }

    #[test]
    fn test_public_base_url() {
        let mut public = PublicConfig::default();
        assert_eq!(public.base_url(), "http://localhost:8080");

        public.https = true;
        public.domain = "paste.example.org".to_string();
        assert_eq!(public.base_url(), "https://paste.example.org");
    }

    #[test]
    fn test_limits_defaults() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.capacity, 1);
        assert_eq!(limits.refill_interval_secs, 5);
        assert_eq!(limits.max_upload_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_telemetry_defaults() {
        let telemetry = TelemetryConfig::default();
        assert_eq!(telemetry.otlp_endpoint, None);
        assert_eq!(telemetry.log_level, "info");
    }
}
