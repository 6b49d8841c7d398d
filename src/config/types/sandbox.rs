//! Sandbox configuration types
//!
//! Per-tier limits, environment policy, container runtimes and the reaper.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::sandbox::{Language, SecurityLevel};

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Maximum code length in characters
    #[serde(default = "default_max_code_chars")]
    pub max_code_chars: usize,
    /// Maximum captured output in bytes
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
    /// Executions allowed to run at once; the rest queue
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
    /// Level used when a request does not name one
    #[serde(default)]
    pub default_security_level: SecurityLevel,
    /// Per-tier limits
    #[serde(default)]
    pub tiers: TiersConfig,
    /// Caller environment variable policy
    #[serde(default)]
    pub environment: EnvPolicyConfig,
    /// Container tier configuration
    #[serde(default)]
    pub container: ContainerConfig,
    /// Background cleanup
    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            max_code_chars: default_max_code_chars(),
            max_output_bytes: default_max_output(),
            max_concurrent_executions: default_max_concurrent(),
            default_security_level: SecurityLevel::default(),
            tiers: TiersConfig::default(),
            environment: EnvPolicyConfig::default(),
            container: ContainerConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

fn default_max_code_chars() -> usize {
    100_000
}

fn default_max_output() -> usize {
    1024 * 1024 // 1MB
}

fn default_max_concurrent() -> usize {
    16
}

/// Limits for every tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiersConfig {
    #[serde(default = "TierLimitsConfig::maximum")]
    pub maximum: TierLimitsConfig,
    #[serde(default = "TierLimitsConfig::high")]
    pub high: TierLimitsConfig,
    #[serde(default = "TierLimitsConfig::medium")]
    pub medium: TierLimitsConfig,
    #[serde(default = "TierLimitsConfig::low")]
    pub low: TierLimitsConfig,
}

impl Default for TiersConfig {
    fn default() -> Self {
        TiersConfig {
            maximum: TierLimitsConfig::maximum(),
            high: TierLimitsConfig::high(),
            medium: TierLimitsConfig::medium(),
            low: TierLimitsConfig::low(),
        }
    }
}

impl TiersConfig {
    pub fn for_level(&self, level: SecurityLevel) -> &TierLimitsConfig {
        match level {
            SecurityLevel::Maximum => &self.maximum,
            SecurityLevel::High => &self.high,
            SecurityLevel::Medium => &self.medium,
            SecurityLevel::Low => &self.low,
        }
    }
}

/// Defaults and hard ceilings for one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimitsConfig {
    /// Default memory limit (e.g. "128m")
    pub memory: String,
    /// Hard memory ceiling
    pub max_memory: String,
    /// Default share of one CPU
    pub cpu_share: f64,
    /// Hard CPU ceiling
    pub max_cpu_share: f64,
    /// Default wall-clock timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Hard timeout ceiling
    #[serde(with = "humantime_serde")]
    pub max_timeout: Duration,
}

impl TierLimitsConfig {
    fn new(memory: &str, max_memory: &str) -> Self {
        TierLimitsConfig {
            memory: memory.to_string(),
            max_memory: max_memory.to_string(),
            cpu_share: 0.5,
            max_cpu_share: 1.0,
            timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(30),
        }
    }

    pub fn maximum() -> Self {
        Self::new("128m", "512m")
    }

    pub fn high() -> Self {
        Self::new("128m", "256m")
    }

    pub fn medium() -> Self {
        Self::new("64m", "128m")
    }

    pub fn low() -> Self {
        Self::new("64m", "256m")
    }
}

/// Caller environment variable policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvPolicyConfig {
    /// Maximum number of variables kept
    #[serde(default = "default_max_env_vars")]
    pub max_vars: usize,
    /// Maximum value length in bytes
    #[serde(default = "default_max_env_value")]
    pub max_value_bytes: usize,
    /// Additional denied names, matched case-insensitively
    #[serde(default)]
    pub denied_names: Vec<String>,
}

impl Default for EnvPolicyConfig {
    fn default() -> Self {
        EnvPolicyConfig {
            max_vars: default_max_env_vars(),
            max_value_bytes: default_max_env_value(),
            denied_names: Vec::new(),
        }
    }
}

fn default_max_env_vars() -> usize {
    64
}

fn default_max_env_value() -> usize {
    1000
}

/// Container (Docker) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Docker host URL; local defaults when unset
    #[serde(default)]
    pub docker_host: Option<String>,
    /// Network mode
    #[serde(default = "default_network")]
    pub network: String,
    /// User the script runs as inside the container
    #[serde(default = "default_user")]
    pub user: String,
    /// CFS period in microseconds
    #[serde(default = "default_cpu_period")]
    pub cpu_period: i64,
    /// Maximum processes in the container
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    /// Open file descriptor ulimit
    #[serde(default = "default_nofile")]
    pub nofile: i64,
    /// Process count ulimit
    #[serde(default = "default_nproc")]
    pub nproc: i64,
    /// Size of the writable /tmp tmpfs
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
    /// Prefix for container names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Pull missing images at startup instead of only warning
    #[serde(default)]
    pub pull_missing_images: bool,
    /// Per-language runtimes
    #[serde(default)]
    pub runtimes: RuntimesConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            docker_host: None,
            network: default_network(),
            user: default_user(),
            cpu_period: default_cpu_period(),
            pids_limit: default_pids_limit(),
            nofile: default_nofile(),
            nproc: default_nproc(),
            tmpfs_size: default_tmpfs_size(),
            name_prefix: default_name_prefix(),
            pull_missing_images: false,
            runtimes: RuntimesConfig::default(),
        }
    }
}

fn default_network() -> String {
    "none".to_string()
}

fn default_user() -> String {
    "65534:65534".to_string()
}

fn default_cpu_period() -> i64 {
    100_000
}

fn default_pids_limit() -> i64 {
    64
}

fn default_nofile() -> i64 {
    64
}

fn default_nproc() -> i64 {
    16
}

fn default_tmpfs_size() -> String {
    "16m".to_string()
}

fn default_name_prefix() -> String {
    "sandbox-exec".to_string()
}

/// Image and command used for each language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimesConfig {
    #[serde(default = "LanguageRuntime::javascript")]
    pub javascript: LanguageRuntime,
    #[serde(default = "LanguageRuntime::python")]
    pub python: LanguageRuntime,
    #[serde(default = "LanguageRuntime::lua")]
    pub lua: LanguageRuntime,
    #[serde(default = "LanguageRuntime::csharp")]
    pub csharp: LanguageRuntime,
}

impl Default for RuntimesConfig {
    fn default() -> Self {
        RuntimesConfig {
            javascript: LanguageRuntime::javascript(),
            python: LanguageRuntime::python(),
            lua: LanguageRuntime::lua(),
            csharp: LanguageRuntime::csharp(),
        }
    }
}

impl RuntimesConfig {
    pub fn for_language(&self, language: Language) -> &LanguageRuntime {
        match language {
            Language::JavaScript => &self.javascript,
            Language::Python => &self.python,
            Language::Lua => &self.lua,
            Language::CSharp => &self.csharp,
        }
    }

    pub fn all(&self) -> [(Language, &LanguageRuntime); 4] {
        [
            (Language::JavaScript, &self.javascript),
            (Language::Python, &self.python),
            (Language::Lua, &self.lua),
            (Language::CSharp, &self.csharp),
        ]
    }
}

/// One container runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageRuntime {
    /// Docker image
    pub image: String,
    /// File name the code is written to under /sandbox
    pub file: String,
    /// Entrypoint command, the code file path is appended
    pub command: Vec<String>,
}

impl LanguageRuntime {
    fn new(image: &str, file: &str, command: &[&str]) -> Self {
        LanguageRuntime {
            image: image.to_string(),
            file: file.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn javascript() -> Self {
        Self::new("node:20-alpine", "main.js", &["node"])
    }

    pub fn python() -> Self {
        Self::new("python:3.12-alpine", "main.py", &["python3", "-B"])
    }

    pub fn lua() -> Self {
        Self::new("sandbox/lua:5.4", "main.lua", &["lua"])
    }

    pub fn csharp() -> Self {
        Self::new("sandbox/dotnet-script:latest", "main.csx", &["dotnet-script"])
    }
}

/// Background cleanup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Run the reaper at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sweep interval
    #[serde(default = "default_reaper_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// How long an exited handle may linger before it is removed
    #[serde(default = "default_orphan_grace", with = "humantime_serde")]
    pub orphan_grace: Duration,
    /// Handles older than this are treated as hung
    #[serde(default = "default_max_execution_age", with = "humantime_serde")]
    pub max_execution_age: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            enabled: true,
            interval: default_reaper_interval(),
            orphan_grace: default_orphan_grace(),
            max_execution_age: default_max_execution_age(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_orphan_grace() -> Duration {
    Duration::from_secs(60)
}

fn default_max_execution_age() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Parse a memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> Option<u64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, unit) = if limit.ends_with('g') || limit.ends_with("gb") {
        (limit.trim_end_matches(|c| c == 'g' || c == 'b'), "g")
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        (limit.trim_end_matches(|c| c == 'm' || c == 'b'), "m")
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        (limit.trim_end_matches(|c| c == 'k' || c == 'b'), "k")
    } else {
        (limit.trim_end_matches('b'), "b")
    };

    let num: u64 = num_str.trim().parse().ok()?;

    match unit {
        "g" => num.checked_mul(1024 * 1024 * 1024),
        "m" => num.checked_mul(1024 * 1024),
        "k" => num.checked_mul(1024),
        _ => Some(num),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1024k"), Some(1024 * 1024));
        assert_eq!(parse_memory_limit("64MB"), Some(64 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1024"), Some(1024));
        assert_eq!(parse_memory_limit("lots"), None);
    }

    #[test]
    fn test_sandbox_config_default() {
        let config = SandboxConfig::default();
        assert_eq!(config.max_code_chars, 100_000);
        assert_eq!(config.default_security_level, SecurityLevel::High);
        assert_eq!(config.container.network, "none");
        assert_eq!(config.tiers.high.timeout, Duration::from_secs(10));
        assert_eq!(config.reaper.interval, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_tier_config_uses_defaults() {
        let config: SandboxConfig = toml::from_str(
            r#"
            max_concurrent_executions = 4

            [tiers.medium]
            memory = "32m"
            max_memory = "64m"
            cpu_share = 0.25
            max_cpu_share = 0.5
            timeout = "2s"
            max_timeout = "5s"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent_executions, 4);
        assert_eq!(config.tiers.medium.timeout, Duration::from_secs(2));
        assert_eq!(config.tiers.high.memory, "128m");
        assert_eq!(config.container.runtimes.python.file, "main.py");
    }
}
