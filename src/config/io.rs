//! Configuration I/O - Loading and saving configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;
use std::str::FromStr;

use super::types::Config;
use crate::error::{Error, Result};

/// A snapshot of the configuration file
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Path to the config file
    pub path: std::path::PathBuf,
    /// Whether the file exists
    pub exists: bool,
    /// Parsed configuration
    pub config: Option<Config>,
    /// Problems reading or parsing the file
    pub issues: Vec<String>,
}

/// Load configuration with layered precedence:
/// 1. Config file if it exists, otherwise defaults
/// 2. Environment variable overrides (includes .env)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    let extension = path.extension().and_then(|ext| ext.to_str());
    let config: Config = match extension {
        Some("json") | Some("json5") => json5::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?,
        Some("toml") => toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?,
        _ => json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?,
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` first, then overlays any set variables. Unparsable values
/// are ignored with a warning.
pub fn apply_env_overrides(config: &mut Config) {
    dotenvy::dotenv().ok();

    let sandbox = &mut config.sandbox;

    if let Some(level) = parsed_env("SANDBOX_DEFAULT_SECURITY_LEVEL") {
        sandbox.default_security_level = level;
    }
    if let Some(n) = parsed_env("SANDBOX_MAX_CONCURRENT") {
        sandbox.max_concurrent_executions = n;
    }
    if let Some(n) = parsed_env("SANDBOX_MAX_CODE_CHARS") {
        sandbox.max_code_chars = n;
    }
    if let Some(n) = parsed_env("SANDBOX_MAX_OUTPUT_BYTES") {
        sandbox.max_output_bytes = n;
    }
    if let Ok(host) = std::env::var("DOCKER_HOST") {
        sandbox.container.docker_host = Some(host);
    }
    if let Ok(v) = std::env::var("SANDBOX_PULL_IMAGES") {
        sandbox.container.pull_missing_images = v == "true" || v == "1";
    }
    if let Ok(v) = std::env::var("SANDBOX_REAPER_INTERVAL") {
        match humantime_serde::re::humantime::parse_duration(&v) {
            Ok(d) => sandbox.reaper.interval = d,
            Err(e) => tracing::warn!("Ignoring SANDBOX_REAPER_INTERVAL={}: {}", v, e),
        }
    }
    if let Ok(v) = std::env::var("SANDBOX_REAPER_ENABLED") {
        sandbox.reaper.enabled = v != "false" && v != "0";
    }

    if let Ok(level) = std::env::var("RUST_LOG") {
        config.log.level = level;
    }
    if let Some(format) = parsed_env("LOG_FORMAT") {
        config.log.format = format;
    }
}

fn parsed_env<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring {}={}: {}", name, raw, e);
            None
        }
    }
}

/// Save configuration to a file
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = if path.extension().map_or(false, |ext| ext == "toml") {
        toml::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    } else {
        serde_json::to_string_pretty(config)?
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}

/// Read a configuration file into a snapshot
pub fn read_config_snapshot(path: &Path) -> ConfigSnapshot {
    if !path.exists() {
        return ConfigSnapshot {
            path: path.to_path_buf(),
            exists: false,
            config: None,
            issues: vec!["Configuration file does not exist".to_string()],
        };
    }

    match load_config_from_path(path) {
        Ok(config) => ConfigSnapshot {
            path: path.to_path_buf(),
            exists: true,
            config: Some(config),
            issues: Vec::new(),
        },
        Err(e) => ConfigSnapshot {
            path: path.to_path_buf(),
            exists: true,
            config: None,
            issues: vec![e.to_string()],
        },
    }
}
