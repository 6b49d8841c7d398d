//! Configuration validation
//!
//! Validates configuration and reports issues.

use super::types::sandbox::{parse_memory_limit, SandboxConfig, TierLimitsConfig};
use super::types::Config;
use crate::sandbox::{SecurityLevel, JS_HEAP_FLOOR_BYTES};

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    validate_sandbox_config(&config.sandbox)
}

/// Validate the sandbox section on its own
pub fn validate_sandbox_config(config: &SandboxConfig) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_limits_config(config, result);

    for level in SecurityLevel::ALL {
        result = validate_tier(level, config.tiers.for_level(level), result);
    }

    result = validate_container_config(config, result);

    result = validate_reaper_config(config, result);

    result
}

fn validate_limits_config(
    sandbox: &SandboxConfig,
    mut result: ConfigValidationResult,
) -> ConfigValidationResult {

    if sandbox.max_concurrent_executions == 0 {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.max_concurrent_executions",
                "At least one concurrent execution is required",
            )
            .with_suggestion("Set sandbox.max_concurrent_executions to 1 or more"),
        );
    }

    if sandbox.max_code_chars == 0 {
        result = result.with_error(ValidationIssue::new(
            "sandbox.max_code_chars",
            "Code size cap must be positive",
        ));
    }

    if sandbox.max_output_bytes < 1024 {
        result = result.with_warning(ValidationIssue::new(
            "sandbox.max_output_bytes",
            format!(
                "Output cap of {} bytes will truncate almost every script",
                sandbox.max_output_bytes
            ),
        ));
    }

    result
}

fn validate_tier(
    level: SecurityLevel,
    tier: &TierLimitsConfig,
    mut result: ConfigValidationResult,
) -> ConfigValidationResult {
    let prefix = format!("sandbox.tiers.{}", level);

    let memory = parse_memory_limit(&tier.memory);
    let max_memory = parse_memory_limit(&tier.max_memory);

    for (field, raw, parsed) in [
        ("memory", &tier.memory, memory),
        ("max_memory", &tier.max_memory, max_memory),
    ] {
        match parsed {
            None => {
                result = result.with_error(
                    ValidationIssue::new(
                        format!("{}.{}", prefix, field),
                        format!("Unparsable memory size: {}", raw),
                    )
                    .with_suggestion("Use a size such as \"64m\" or \"1g\""),
                );
            }
            Some(0) => {
                result = result.with_error(ValidationIssue::new(
                    format!("{}.{}", prefix, field),
                    "Memory limit must be positive",
                ));
            }
            Some(_) => {}
        }
    }

    if let (Some(memory), Some(max_memory)) = (memory, max_memory) {
        if memory > max_memory {
            result = result.with_error(ValidationIssue::new(
                format!("{}.memory", prefix),
                "Default memory is above the tier ceiling",
            ));
        }
        if matches!(level, SecurityLevel::High | SecurityLevel::Low)
            && max_memory < JS_HEAP_FLOOR_BYTES
        {
            result = result.with_warning(ValidationIssue::new(
                format!("{}.max_memory", prefix),
                format!(
                    "Ceiling is below the {} byte V8 heap floor and will be raised",
                    JS_HEAP_FLOOR_BYTES
                ),
            ));
        }
    }

    for (field, share) in [("cpu_share", tier.cpu_share), ("max_cpu_share", tier.max_cpu_share)] {
        if !share.is_finite() || share <= 0.0 || share > 1.0 {
            result = result.with_error(
                ValidationIssue::new(
                    format!("{}.{}", prefix, field),
                    format!("CPU share {} is outside (0, 1]", share),
                )
                .with_suggestion("Use a fraction of one CPU, e.g. 0.5"),
            );
        }
    }
    if tier.cpu_share > tier.max_cpu_share {
        result = result.with_error(ValidationIssue::new(
            format!("{}.cpu_share", prefix),
            "Default CPU share is above the tier ceiling",
        ));
    }

    if tier.timeout.is_zero() || tier.max_timeout.is_zero() {
        result = result.with_error(ValidationIssue::new(
            format!("{}.timeout", prefix),
            "Timeouts must be positive",
        ));
    }
    if tier.timeout > tier.max_timeout {
        result = result.with_error(ValidationIssue::new(
            format!("{}.timeout", prefix),
            "Default timeout is above the tier ceiling",
        ));
    }

    result
}

fn validate_container_config(
    config: &SandboxConfig,
    mut result: ConfigValidationResult,
) -> ConfigValidationResult {
    let container = &config.container;

    if container.network != "none" {
        result = result.with_warning(
            ValidationIssue::new(
                "sandbox.container.network",
                format!("Containers will have network mode '{}'", container.network),
            )
            .with_suggestion("Use \"none\" to keep scripts offline"),
        );
    }

    if parse_memory_limit(&container.tmpfs_size).is_none() {
        result = result.with_error(ValidationIssue::new(
            "sandbox.container.tmpfs_size",
            format!("Unparsable size: {}", container.tmpfs_size),
        ));
    }

    if container.cpu_period <= 0 || container.pids_limit <= 0 {
        result = result.with_error(ValidationIssue::new(
            "sandbox.container",
            "cpu_period and pids_limit must be positive",
        ));
    }

    for (language, runtime) in container.runtimes.all() {
        if runtime.image.is_empty() || runtime.command.is_empty() {
            result = result.with_error(
                ValidationIssue::new(
                    format!("sandbox.container.runtimes.{}", language),
                    "Runtime needs an image and a command",
                )
                .with_suggestion("Set image and command for this language"),
            );
        }
    }

    result
}

fn validate_reaper_config(
    config: &SandboxConfig,
    mut result: ConfigValidationResult,
) -> ConfigValidationResult {
    let reaper = &config.reaper;

    if reaper.enabled && reaper.interval.is_zero() {
        result = result.with_error(ValidationIssue::new(
            "sandbox.reaper.interval",
            "Reaper interval must be positive",
        ));
    }

    let longest_timeout = SecurityLevel::ALL
        .iter()
        .map(|level| config.tiers.for_level(*level).max_timeout)
        .max()
        .unwrap_or_default();
    if reaper.max_execution_age <= longest_timeout {
        result = result.with_warning(
            ValidationIssue::new(
                "sandbox.reaper.max_execution_age",
                "Reaper may terminate executions that are still inside their timeout",
            )
            .with_suggestion("Set max_execution_age above the largest tier max_timeout"),
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        let result = validate_config(&config);

        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_ceiling_below_default_is_error() {
        let mut config = Config::default();
        config.sandbox.tiers.medium.memory = "256m".to_string();
        config.sandbox.tiers.medium.max_memory = "128m".to_string();
        config.sandbox.tiers.low.timeout = Duration::from_secs(60);

        let result = validate_config(&config);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.path == "sandbox.tiers.medium.memory"));
        assert!(result.errors.iter().any(|e| e.path == "sandbox.tiers.low.timeout"));
    }

    #[test]
    fn test_bad_values_reported() {
        let mut config = Config::default();
        config.sandbox.max_concurrent_executions = 0;
        config.sandbox.tiers.maximum.cpu_share = 1.5;
        config.sandbox.tiers.high.memory = "plenty".to_string();

        let result = validate_config(&config);
        assert_eq!(result.errors.len(), 4);
    }

    #[test]
    fn test_open_network_is_warning() {
        let mut config = Config::default();
        config.sandbox.container.network = "bridge".to_string();

        let result = validate_config(&config);
        assert!(result.valid);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.path == "sandbox.container.network"));
    }
}
