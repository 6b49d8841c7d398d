//! Configuration module
//!
//! - types/mod.rs: Core configuration types (Config, LogConfig)
//! - types/sandbox.rs: Sandbox tiers, container runtimes and reaper
//! - io.rs: Configuration loading and saving
//! - validation.rs: Configuration validation
//! - paths.rs: Configuration file paths

mod io;
mod paths;
mod types;
mod validation;

pub use types::{Config, LogConfig, LogFormat};

pub use types::sandbox::{
    parse_memory_limit, ContainerConfig, EnvPolicyConfig, LanguageRuntime, ReaperConfig,
    RuntimesConfig, SandboxConfig, TierLimitsConfig, TiersConfig,
};

pub use io::{
    apply_env_overrides, load_config, load_config_from_path, read_config_snapshot, save_config,
    ConfigSnapshot,
};
pub use paths::{config_dir, config_path};
pub use validation::{
    validate_config, validate_sandbox_config, ConfigValidationResult, ValidationIssue,
};
