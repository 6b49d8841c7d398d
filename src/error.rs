//! Error types for the sandbox

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the sandbox Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sandbox
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request rejected before any backend resource was allocated
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Wall-clock limit exceeded
    #[error("Execution timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Docker/container error
    #[error("Container error: {0}")]
    Container(String),

    /// V8 isolate error
    #[error("Isolate error: {0}")]
    Isolate(String),

    /// Embedded interpreter error
    #[error("Interpreter error: {0}")]
    Interpreter(String),

    /// Worker thread error
    #[error("Worker error: {0}")]
    Worker(String),

    /// The script itself threw or exited non-zero
    #[error("{message}")]
    Script { message: String, output: String },

    /// Memory ceiling reached
    #[error("Memory limit of {limit_bytes} bytes exceeded")]
    MemoryLimit { limit_bytes: u64 },

    /// Stopped through terminate, the reaper or shutdown
    #[error("Execution terminated")]
    Terminated,

    /// The selected tier cannot run this language
    #[error("Backend '{backend}' does not support language '{language}'")]
    UnsupportedLanguage { backend: String, language: String },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure taxonomy reported in execution results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    Timeout,
    BackendFault,
    ScriptRuntime,
    ResourceLimit,
    Terminated,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::BackendFault => write!(f, "backend-fault"),
            ErrorKind::ScriptRuntime => write!(f, "script-runtime"),
            ErrorKind::ResourceLimit => write!(f, "resource-limit"),
            ErrorKind::Terminated => write!(f, "terminated"),
        }
    }
}

/// Category of a static validation rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleCategory {
    Filesystem,
    Process,
    Network,
    DynamicEval,
    Introspection,
}

impl RuleCategory {
    pub const ALL: [RuleCategory; 5] = [
        RuleCategory::Filesystem,
        RuleCategory::Process,
        RuleCategory::Network,
        RuleCategory::DynamicEval,
        RuleCategory::Introspection,
    ];
}

impl std::fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleCategory::Filesystem => write!(f, "filesystem"),
            RuleCategory::Process => write!(f, "process"),
            RuleCategory::Network => write!(f, "network"),
            RuleCategory::DynamicEval => write!(f, "dynamic-eval"),
            RuleCategory::Introspection => write!(f, "introspection"),
        }
    }
}

/// A request that failed static validation or limit resolution
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} (rule: {rule})")]
pub struct ValidationError {
    /// Stable name of the violated rule
    pub rule: String,
    /// Rule category, when the rule is a denylist pattern
    pub category: Option<RuleCategory>,
    /// Human-readable message
    pub message: String,
}

impl ValidationError {
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError {
            rule: rule.into(),
            category: None,
            message: message.into(),
        }
    }

    pub fn with_category(mut self, category: RuleCategory) -> Self {
        self.category = Some(category);
        self
    }
}

impl Error {
    /// Map onto the result taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::InvalidInput(_) => ErrorKind::Validation,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Script { .. } => ErrorKind::ScriptRuntime,
            Error::MemoryLimit { .. } => ErrorKind::ResourceLimit,
            Error::Terminated => ErrorKind::Terminated,
            Error::Config(_)
            | Error::Container(_)
            | Error::Isolate(_)
            | Error::Interpreter(_)
            | Error::Worker(_)
            | Error::UnsupportedLanguage { .. }
            | Error::Json(_)
            | Error::Io(_)
            | Error::Internal(_) => ErrorKind::BackendFault,
        }
    }

    /// Check if error is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::InvalidInput(_) | Error::UnsupportedLanguage { .. }
        )
    }

    /// Output captured before the failure, if any
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Error::Script { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Container(err.to_string())
    }
}

impl From<mlua::Error> for Error {
    fn from(err: mlua::Error) -> Self {
        Error::Interpreter(err.to_string())
    }
}
