//! Configuration paths
//!
//! Utilities for resolving configuration file paths.

use std::path::PathBuf;

const APP_DIR: &str = "tiered-sandbox";

/// Get the configuration directory
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SANDBOX_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".config").join(APP_DIR))
                .unwrap_or_else(|| PathBuf::from(".tiered-sandbox"))
        })
}

/// Get the main configuration file path
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SANDBOX_CONFIG") {
        return PathBuf::from(path);
    }

    config_dir().join("config.json")
}
