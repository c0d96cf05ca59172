//! Config file discovery, layered merging and environment overlay.

use crate::{ConfigError, StashConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Where the effective config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded, in order.
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI-supplied path.
///
/// Returns existing files in load order: system, user, then the CLI path if
/// given, otherwise `./stash.toml`.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/stash/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("stash/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        files.push(path.to_path_buf());
        return files;
    }

    let local = PathBuf::from("stash.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Recursively merge `overlay` into `base`. Tables merge key by key; any other
/// value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Deserialize a merged table, filling gaps from compiled defaults.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<StashConfig, ConfigError> {
    let mut config: StashConfig = toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;

    config.paths.storage_dir = expand_path(&config.paths.storage_dir.to_string_lossy());
    Ok(config)
}

/// Load a single config file on top of compiled defaults.
pub fn load_from_file(path: &Path) -> Result<StashConfig, ConfigError> {
    from_table(read_table(path)?, path)
}

/// Apply `STASH_*` overrides from the process environment.
pub fn apply_env_overrides(config: &mut StashConfig, sources: &mut ConfigSources) -> Result<(), ConfigError> {
    apply_overrides_from(config, sources, |key| env::var(key).ok())
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Apply overrides using `lookup` in place of the process environment.
pub fn apply_overrides_from<F>(
    config: &mut StashConfig,
    sources: &mut ConfigSources,
    lookup: F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut hit = |key: &str| -> Option<String> {
        let value = lookup(key)?;
        sources.env_overrides.push(key.to_string());
        Some(value)
    };

    if let Some(v) = hit("STASH_STORAGE_DIR") {
        config.paths.storage_dir = expand_path(&v);
    }

    if let Some(v) = hit("STASH_LISTEN") {
        config.bind.listen = v;
    }

    if let Some(v) = hit("STASH_DOMAIN") {
        config.public.domain = v;
    }
    if let Some(v) = hit("STASH_HTTPS") {
        config.public.https = parse_bool("STASH_HTTPS", &v)?;
    }

    if let Some(v) = hit("STASH_RATE_CAPACITY") {
        config.limits.capacity = parse_var("STASH_RATE_CAPACITY", &v)?;
    }
    if let Some(v) = hit("STASH_REFILL_INTERVAL_SECS") {
        config.limits.refill_interval_secs = parse_var("STASH_REFILL_INTERVAL_SECS", &v)?;
    }
    if let Some(v) = hit("STASH_MAX_CLIENTS") {
        config.limits.max_clients = parse_var("STASH_MAX_CLIENTS", &v)?;
    }
    if let Some(v) = hit("STASH_CLIENT_IDLE_SECS") {
        config.limits.client_idle_secs = parse_var("STASH_CLIENT_IDLE_SECS", &v)?;
    }
    if let Some(v) = hit("STASH_MAX_UPLOAD_BYTES") {
        config.limits.max_upload_bytes = parse_var("STASH_MAX_UPLOAD_BYTES", &v)?;
    }

    if let Some(v) = hit("STASH_ID_LENGTH") {
        config.store.id_length = parse_var("STASH_ID_LENGTH", &v)?;
    }
    if let Some(v) = hit("STASH_STRICT_METADATA") {
        config.store.strict_metadata = parse_bool("STASH_STRICT_METADATA", &v)?;
    }
    if let Some(v) = hit("STASH_SWEEP_INTERVAL_SECS") {
        config.store.sweep_interval_secs = parse_var("STASH_SWEEP_INTERVAL_SECS", &v)?;
    }
    if let Some(v) = hit("STASH_ORPHAN_GRACE_SECS") {
        config.store.orphan_grace_secs = parse_var("STASH_ORPHAN_GRACE_SECS", &v)?;
    }

    if let Some(v) = hit("STASH_DEFAULT_EXPIRY") {
        config.expiry.default = v;
    }

    if let Some(v) = hit("STASH_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
    }
    // Standard OTEL variable wins over ours.
    if let Some(v) = hit("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
    }
    if let Some(v) = hit("STASH_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
    if let Some(v) = hit("RUST_LOG") {
        config.telemetry.log_level = v;
    }

    Ok(())
}

/// Expand `~/` and a leading `$VAR` in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        return match directories::BaseDirs::new() {
            Some(dirs) => dirs.home_dir().join(stripped),
            None => PathBuf::from(path),
        };
    }

    if let Some(stripped) = path.strip_prefix('$') {
        let (var_name, rest) = match stripped.find('/') {
            Some(slash) => (&stripped[..slash], Some(&stripped[slash + 1..])),
            None => (stripped, None),
        };
        return match (env::var(var_name), rest) {
            (Ok(value), Some(rest)) => PathBuf::from(value).join(rest),
            (Ok(value), None) => PathBuf::from(value),
            (Err(_), _) => PathBuf::from(path),
        };
    }

    PathBuf::from(path)
}
