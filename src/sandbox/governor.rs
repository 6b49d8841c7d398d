//! Resource governor
//!
//! Resolves per-request limits against tier defaults and ceilings, and
//! filters the caller's environment variables.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::config::{parse_memory_limit, EnvPolicyConfig, TierLimitsConfig, TiersConfig};
use crate::error::{Error, Result, ValidationError};
use crate::sandbox::executor::{ExecutionLimits, ExecutionRequest, Language, SecurityLevel};

/// Smallest heap a V8 runtime is given, whatever the caller asks for
pub const JS_HEAP_FLOOR_BYTES: u64 = 16 * 1024 * 1024;

/// Exact names that never reach a script, compared case-insensitively
const DENIED_ENV_NAMES: &[&str] = &[
    "PATH",
    "HOME",
    "NODE_PATH",
    "NODE_OPTIONS",
    "PYTHONPATH",
    "PYTHONHOME",
    "PYTHONSTARTUP",
    "LUA_PATH",
    "LUA_CPATH",
    "LUA_INIT",
];

/// Name prefixes that never reach a script
const DENIED_ENV_PREFIXES: &[&str] = &["LD_", "DYLD_", "DOTNET_", "LUA_PATH_", "LUA_CPATH_"];

#[derive(Debug, Clone, Copy)]
struct TierLimits {
    default: ExecutionLimits,
    ceiling: ExecutionLimits,
}

impl TierLimits {
    fn from_config(level: SecurityLevel, config: &TierLimitsConfig) -> Result<Self> {
        let memory = |raw: &str| {
            parse_memory_limit(raw).filter(|b| *b > 0).ok_or_else(|| {
                Error::Config(format!("Invalid memory size '{}' for tier {}", raw, level))
            })
        };

        let share = |field: &str, share: f64| {
            if share.is_finite() && share > 0.0 && share <= 1.0 {
                Ok(share)
            } else {
                Err(Error::Config(format!(
                    "{} {} for tier {} is outside (0, 1]",
                    field, share, level
                )))
            }
        };
        let timeout = |field: &str, timeout: Duration| {
            if timeout.is_zero() {
                Err(Error::Config(format!("{} for tier {} must be positive", field, level)))
            } else {
                Ok(timeout)
            }
        };

        Ok(TierLimits {
            default: ExecutionLimits {
                memory_bytes: memory(&config.memory)?,
                cpu_share: share("cpu_share", config.cpu_share)?,
                timeout: timeout("timeout", config.timeout)?,
            },
            ceiling: ExecutionLimits {
                memory_bytes: memory(&config.max_memory)?,
                cpu_share: share("max_cpu_share", config.max_cpu_share)?,
                timeout: timeout("max_timeout", config.max_timeout)?,
            },
        })
    }
}

/// Resource governor
#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    maximum: TierLimits,
    high: TierLimits,
    medium: TierLimits,
    low: TierLimits,
    env_policy: EnvPolicyConfig,
}

impl ResourceGovernor {
    pub fn new(tiers: &TiersConfig, env_policy: &EnvPolicyConfig) -> Result<Self> {
        Ok(ResourceGovernor {
            maximum: TierLimits::from_config(SecurityLevel::Maximum, &tiers.maximum)?,
            high: TierLimits::from_config(SecurityLevel::High, &tiers.high)?,
            medium: TierLimits::from_config(SecurityLevel::Medium, &tiers.medium)?,
            low: TierLimits::from_config(SecurityLevel::Low, &tiers.low)?,
            env_policy: env_policy.clone(),
        })
    }

    fn tier(&self, level: SecurityLevel) -> &TierLimits {
        match level {
            SecurityLevel::Maximum => &self.maximum,
            SecurityLevel::High => &self.high,
            SecurityLevel::Medium => &self.medium,
            SecurityLevel::Low => &self.low,
        }
    }

    /// Tier defaults overlaid with the request's overrides, clamped to the ceiling
    pub fn resolve_limits(
        &self,
        request: &ExecutionRequest,
        level: SecurityLevel,
    ) -> std::result::Result<ExecutionLimits, ValidationError> {
        let tier = self.tier(level);
        let overrides = &request.limits;

        let mut memory_bytes = match overrides.memory_bytes {
            Some(0) => {
                return Err(ValidationError::new(
                    "limits.memory",
                    "memoryBytes must be positive",
                ))
            }
            Some(bytes) => bytes.min(tier.ceiling.memory_bytes),
            None => tier.default.memory_bytes.min(tier.ceiling.memory_bytes),
        };

        let cpu_share = match overrides.cpu_share {
            Some(share) if !share.is_finite() || share <= 0.0 => {
                return Err(ValidationError::new(
                    "limits.cpu",
                    format!("cpuShare must be a positive number, got {}", share),
                ))
            }
            Some(share) => share.min(tier.ceiling.cpu_share),
            None => tier.default.cpu_share.min(tier.ceiling.cpu_share),
        };

        let timeout = match overrides.timeout_ms {
            Some(0) => {
                return Err(ValidationError::new(
                    "limits.timeout",
                    "timeoutMs must be positive",
                ))
            }
            Some(ms) => Duration::from_millis(ms).min(tier.ceiling.timeout),
            None => tier.default.timeout.min(tier.ceiling.timeout),
        };

        if runs_in_v8(level, request.language) {
            memory_bytes = memory_bytes.max(JS_HEAP_FLOOR_BYTES);
        }

        Ok(ExecutionLimits {
            memory_bytes,
            cpu_share,
            timeout,
        })
    }

    /// Drop denied, malformed, oversized and surplus variables. Silent toward the caller.
    pub fn sanitize_environment(&self, vars: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut kept = Vec::new();

        for (name, value) in vars {
            if kept.len() >= self.env_policy.max_vars {
                debug!(name = %name, "Dropping environment variable: count limit reached");
                continue;
            }
            if !is_identifier(name) {
                debug!(name = %name, "Dropping environment variable: invalid name");
                continue;
            }
            if self.is_denied(name) {
                debug!(name = %name, "Dropping environment variable: denied name");
                continue;
            }
            if value.len() >= self.env_policy.max_value_bytes {
                debug!(name = %name, len = value.len(), "Dropping environment variable: value too long");
                continue;
            }
            kept.push((name.clone(), value.clone()));
        }

        kept
    }

    fn is_denied(&self, name: &str) -> bool {
        let upper = name.to_ascii_uppercase();
        DENIED_ENV_NAMES.contains(&upper.as_str())
            || DENIED_ENV_PREFIXES.iter().any(|p| upper.starts_with(p))
            || self
                .env_policy
                .denied_names
                .iter()
                .any(|d| d.eq_ignore_ascii_case(name))
    }
}

fn runs_in_v8(level: SecurityLevel, language: Language) -> bool {
    language == Language::JavaScript && matches!(level, SecurityLevel::High | SecurityLevel::Low)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
