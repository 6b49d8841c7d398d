//! Tier dispatcher
//!
//! The security level picks exactly one backend. There is no fallback: a
//! backend that cannot run the language yields a backend fault without
//! touching the registry.

use tracing::debug;

use crate::error::Error;
use crate::sandbox::executor::{ExecutionJob, ExecutionResult, IsolationBackend, SecurityLevel};
use crate::sandbox::result::{assemble, ExecutionContext};

/// One backend per security level
pub struct TierDispatcher {
    maximum: Box<dyn IsolationBackend>,
    high: Box<dyn IsolationBackend>,
    medium: Box<dyn IsolationBackend>,
    low: Box<dyn IsolationBackend>,
}

impl TierDispatcher {
    pub fn new(
        maximum: Box<dyn IsolationBackend>,
        high: Box<dyn IsolationBackend>,
        medium: Box<dyn IsolationBackend>,
        low: Box<dyn IsolationBackend>,
    ) -> Self {
        TierDispatcher {
            maximum,
            high,
            medium,
            low,
        }
    }

    pub fn backend(&self, level: SecurityLevel) -> &dyn IsolationBackend {
        match level {
            SecurityLevel::Maximum => self.maximum.as_ref(),
            SecurityLevel::High => self.high.as_ref(),
            SecurityLevel::Medium => self.medium.as_ref(),
            SecurityLevel::Low => self.low.as_ref(),
        }
    }

    /// Run `job` on its tier's backend
    pub async fn dispatch(&self, ctx: &ExecutionContext, job: &ExecutionJob) -> ExecutionResult {
        let backend = self.backend(job.security_level);
        if !backend.supports_language(job.language) {
            return assemble(
                ctx,
                Err(Error::UnsupportedLanguage {
                    backend: backend.name().to_string(),
                    language: job.language.to_string(),
                }),
            );
        }

        debug!(
            execution_id = %job.id,
            tier = %job.security_level,
            backend = backend.name(),
            timeout_ms = job.limits.timeout_ms(),
            memory_bytes = job.limits.memory_bytes,
            "Dispatching execution"
        );
        assemble(ctx, backend.run(job).await)
    }
}
