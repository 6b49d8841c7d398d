//! Common backend trait and request/result types

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ErrorKind, Result};

/// Supported script languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "js")]
    JavaScript,
    #[serde(alias = "py")]
    Python,
    Lua,
    #[serde(alias = "cs")]
    CSharp,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::JavaScript,
        Language::Python,
        Language::Lua,
        Language::CSharp,
    ];
}

impl std::str::FromStr for Language {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "python" | "py" => Ok(Language::Python),
            "lua" => Ok(Language::Lua),
            "csharp" | "cs" | "c#" => Ok(Language::CSharp),
            _ => Err(crate::Error::InvalidInput(format!(
                "Unsupported language: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::JavaScript => write!(f, "javascript"),
            Language::Python => write!(f, "python"),
            Language::Lua => write!(f, "lua"),
            Language::CSharp => write!(f, "csharp"),
        }
    }
}

/// Requested isolation strength. Each level maps to exactly one backend.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Ephemeral container
    Maximum,
    /// Fresh V8 isolate with its own heap
    #[default]
    High,
    /// Embedded interpreter sharing the host heap
    Medium,
    /// Plain worker thread
    Low,
}

impl SecurityLevel {
    pub const ALL: [SecurityLevel; 4] = [
        SecurityLevel::Maximum,
        SecurityLevel::High,
        SecurityLevel::Medium,
        SecurityLevel::Low,
    ];
}

impl std::str::FromStr for SecurityLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "maximum" | "max" | "container" => Ok(SecurityLevel::Maximum),
            "high" | "isolate" => Ok(SecurityLevel::High),
            "medium" | "interpreter" => Ok(SecurityLevel::Medium),
            "low" | "worker" => Ok(SecurityLevel::Low),
            _ => Err(crate::Error::InvalidInput(format!(
                "Invalid security level: {}. Valid: maximum, high, medium, low",
                s
            ))),
        }
    }
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityLevel::Maximum => write!(f, "maximum"),
            SecurityLevel::High => write!(f, "high"),
            SecurityLevel::Medium => write!(f, "medium"),
            SecurityLevel::Low => write!(f, "low"),
        }
    }
}

/// Host stand-in APIs a script may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Canvas,
    Audio,
}

impl std::str::FromStr for Capability {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "canvas" => Ok(Capability::Canvas),
            "audio" => Ok(Capability::Audio),
            _ => Err(crate::Error::InvalidInput(format!(
                "Unknown capability: {}. Valid: canvas, audio",
                s
            ))),
        }
    }
}

/// Caller-supplied limit overrides. Unset fields fall back to tier defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_share: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Request to execute a script
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// The source text
    pub code: String,
    /// Script language
    pub language: Language,
    /// Requested isolation level, the configured default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
    /// Limit overrides
    #[serde(default)]
    pub limits: LimitOverrides,
    /// Environment variables (sanitised before use)
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    /// Optional host stand-in APIs
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
}

impl ExecutionRequest {
    /// Create a new execution request at the configured default security level
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        ExecutionRequest {
            code: code.into(),
            language,
            security_level: None,
            limits: LimitOverrides::default(),
            environment_variables: BTreeMap::new(),
            capabilities: BTreeSet::new(),
        }
    }

    /// Set security level
    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = Some(level);
        self
    }

    /// Requested level, or `default` when the request leaves it open
    pub fn level_or(&self, default: SecurityLevel) -> SecurityLevel {
        self.security_level.unwrap_or(default)
    }

    /// Set timeout override
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set memory override
    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.limits.memory_bytes = Some(bytes);
        self
    }

    /// Set CPU share override
    pub fn with_cpu_share(mut self, share: f64) -> Self {
        self.limits.cpu_share = Some(share);
        self
    }

    /// Add environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    /// Request a capability stand-in
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }
}

/// Limits after merging overrides with tier defaults. Always fully populated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionLimits {
    pub memory_bytes: u64,
    /// Fraction of one CPU, in (0, 1]
    pub cpu_share: f64,
    pub timeout: Duration,
}

impl ExecutionLimits {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

/// Everything a backend needs to run one execution
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub id: Uuid,
    pub code: String,
    pub language: Language,
    pub security_level: SecurityLevel,
    pub limits: ExecutionLimits,
    pub capabilities: BTreeSet<Capability>,
    /// Sanitised environment, container tier only
    pub environment: Vec<(String, String)>,
    pub max_output_bytes: usize,
}

/// Resource usage observed for one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_time_ns: u64,
}

/// What a backend hands back on success
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutput {
    pub output: String,
    pub resource_usage: ResourceUsage,
}

/// Size-capped text accumulator shared by the backends
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

pub const TRUNCATION_MARKER: &str = "[output truncated]";

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        OutputBuffer {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append raw text, stopping at the byte limit on a char boundary
    pub fn push_str(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }
        let mut cut = room;
        while !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&chunk[..cut]);
        self.truncated = true;
    }

    /// Append one line, newline-separated from the previous one
    pub fn push_line(&mut self, line: &str) {
        if !self.text.is_empty() {
            self.push_str("\n");
        }
        self.push_str(line);
    }

    /// Stop accepting text, as if the limit had been reached
    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        let mut text = self.text;
        if self.truncated {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Metadata attached to every result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub execution_id: Uuid,
    pub language: Language,
    pub security_level: SecurityLevel,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub resource_usage: ResourceUsage,
}

/// Result of one execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Whether execution was successful
    pub success: bool,
    /// Text captured from the script
    pub output: String,
    /// Error message, empty on success
    pub error: String,
    /// Failure category, absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub metadata: ExecutionMetadata,
}

impl ExecutionResult {
    /// Create a successful result
    pub fn success(output: String, metadata: ExecutionMetadata) -> Self {
        ExecutionResult {
            success: true,
            output,
            error: String::new(),
            error_kind: None,
            metadata,
        }
    }

    /// Create a failure result
    pub fn failure(
        kind: ErrorKind,
        error: String,
        output: String,
        metadata: ExecutionMetadata,
    ) -> Self {
        ExecutionResult {
            success: false,
            output,
            error,
            error_kind: Some(kind),
            metadata,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.error_kind == Some(ErrorKind::Timeout)
    }
}

/// Presence of an execution in each registry map
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub container_active: bool,
    pub worker_active: bool,
    pub queued_execution: bool,
    pub isolate_active: bool,
    pub interpreter_active: bool,
}

impl ExecutionStatus {
    pub fn is_active(&self) -> bool {
        self.container_active
            || self.worker_active
            || self.queued_execution
            || self.isolate_active
            || self.interpreter_active
    }
}

/// Trait for isolation backends
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Check if a language is supported
    fn supports_language(&self, language: Language) -> bool;

    /// Run one job. The backend registers and deregisters its own handle.
    async fn run(&self, job: &ExecutionJob) -> Result<ScriptOutput>;

    /// Get supported languages
    fn supported_languages(&self) -> Vec<Language> {
        Language::ALL
            .into_iter()
            .filter(|l| self.supports_language(*l))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parsing() {
        assert_eq!("javascript".parse::<Language>().unwrap(), Language::JavaScript);
        assert_eq!("py".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("C#".parse::<Language>().unwrap(), Language::CSharp);
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_request_level_left_open() {
        let req: ExecutionRequest =
            serde_json::from_str(r#"{"code": "log(1)", "language": "js"}"#).unwrap();
        assert_eq!(req.security_level, None);
        assert_eq!(req.level_or(SecurityLevel::Low), SecurityLevel::Low);
        assert_eq!(
            req.clone().with_security_level(SecurityLevel::Maximum).level_or(SecurityLevel::Low),
            SecurityLevel::Maximum
        );
        assert_eq!(req.language, Language::JavaScript);
        assert!(req.environment_variables.is_empty());
    }

    #[test]
    fn test_request_builder() {
        let req = ExecutionRequest::new("print(1)", Language::Lua)
            .with_security_level(SecurityLevel::Medium)
            .with_timeout(Duration::from_millis(250))
            .with_env("KEY", "VALUE")
            .with_capability(Capability::Canvas);

        assert_eq!(req.limits.timeout_ms, Some(250));
        assert_eq!(req.environment_variables.get("KEY").map(String::as_str), Some("VALUE"));
        assert!(req.capabilities.contains(&Capability::Canvas));
    }

    #[test]
    fn test_output_buffer_truncates_on_char_boundary() {
        let mut buf = OutputBuffer::new(5);
        buf.push_str("abcé");
        buf.push_str("zzz");
        assert!(buf.is_truncated());
        assert_eq!(buf.into_string(), format!("abcé\n{}", TRUNCATION_MARKER));

        let mut buf = OutputBuffer::new(4);
        buf.push_str("abcé");
        assert_eq!(buf.into_string(), format!("abc\n{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let json = serde_json::to_value(ExecutionStatus::default()).unwrap();
        assert_eq!(json["containerActive"], false);
        assert_eq!(json["queuedExecution"], false);
    }
}
