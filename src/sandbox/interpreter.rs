//! Restricted-interpreter execution
//!
//! Medium tier. Embedded interpreters sharing the host heap, limited by
//! allocator accounting rather than a separate heap. JavaScript runs on
//! QuickJS with `eval` and the function constructors removed. Lua 5.4 loads
//! only `table`, `string`, `math` and `utf8`, with every code loader removed.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sandbox::engine::lua::{self, LuaMode, LuaTask};
use crate::sandbox::engine::quickjs::{self, QuickJsTask};
use crate::sandbox::engine::supervise;
use crate::sandbox::executor::{ExecutionJob, IsolationBackend, Language, ScriptOutput};
use crate::sandbox::registry::{BackendKind, ExecutionRegistry};

/// Embedded interpreter backend
pub struct InterpreterBackend {
    registry: Arc<ExecutionRegistry>,
}

impl InterpreterBackend {
    pub fn new(registry: Arc<ExecutionRegistry>) -> Self {
        InterpreterBackend { registry }
    }
}

#[async_trait]
impl IsolationBackend for InterpreterBackend {
    fn name(&self) -> &str {
        "interpreter"
    }

    fn supports_language(&self, language: Language) -> bool {
        matches!(language, Language::JavaScript | Language::Lua)
    }

    async fn run(&self, job: &ExecutionJob) -> Result<ScriptOutput> {
        match job.language {
            Language::JavaScript => {
                let task = QuickJsTask {
                    code: job.code.clone(),
                    memory_limit_bytes: job.limits.memory_bytes,
                    timeout: job.limits.timeout,
                    capabilities: job.capabilities.clone(),
                    max_output_bytes: job.max_output_bytes,
                };
                supervise(&self.registry, BackendKind::Interpreter, job, Error::Interpreter, |control| {
                    quickjs::spawn(job.id, task, control)
                })
                .await
            }
            Language::Lua => {
                let task = LuaTask {
                    code: job.code.clone(),
                    mode: LuaMode::Restricted,
                    memory_limit_bytes: job.limits.memory_bytes,
                    timeout: job.limits.timeout,
                    capabilities: job.capabilities.clone(),
                    max_output_bytes: job.max_output_bytes,
                };
                supervise(&self.registry, BackendKind::Interpreter, job, Error::Interpreter, |control| {
                    lua::spawn(job.id, task, control)
                })
                .await
            }
            other => Err(Error::UnsupportedLanguage {
                backend: self.name().to_string(),
                language: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::executor::{Capability, ExecutionLimits, SecurityLevel};
    use std::collections::BTreeSet;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    fn job(code: &str, timeout: Duration) -> ExecutionJob {
        job_in(Language::Lua, code, timeout)
    }

    fn job_in(language: Language, code: &str, timeout: Duration) -> ExecutionJob {
        ExecutionJob {
            id: Uuid::new_v4(),
            code: code.to_string(),
            language,
            security_level: SecurityLevel::Medium,
            limits: ExecutionLimits {
                memory_bytes: 16 * 1024 * 1024,
                cpu_share: 0.5,
                timeout,
            },
            capabilities: BTreeSet::new(),
            environment: Vec::new(),
            max_output_bytes: 64 * 1024,
        }
    }

    #[test]
    fn test_supported_languages() {
        let backend = InterpreterBackend::new(ExecutionRegistry::new());
        assert!(backend.supports_language(Language::Lua));
        assert!(backend.supports_language(Language::JavaScript));
        assert!(!backend.supports_language(Language::Python));
        assert!(!backend.supports_language(Language::CSharp));
    }

    #[tokio::test]
    async fn test_javascript_console_and_result() {
        let registry = ExecutionRegistry::new();
        let backend = InterpreterBackend::new(registry.clone());
        let out = backend
            .run(&job_in(
                Language::JavaScript,
                "console.log('sum', 1 + 2); typeof eval",
                Duration::from_secs(5),
            ))
            .await
            .unwrap();
        assert_eq!(out.output, "sum 3\nundefined");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_javascript_infinite_loop_times_out() {
        let registry = ExecutionRegistry::new();
        let backend = InterpreterBackend::new(registry.clone());
        let err = backend
            .run(&job_in(Language::JavaScript, "while(true){}", Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 200 }), "got {err:?}");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_python_rejected() {
        let backend = InterpreterBackend::new(ExecutionRegistry::new());
        let err = backend
            .run(&job_in(Language::Python, "print(1)", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedLanguage { .. }));
    }

    #[tokio::test]
    async fn test_console_and_result() {
        let registry = ExecutionRegistry::new();
        let backend = InterpreterBackend::new(registry.clone());
        let out = backend
            .run(&job("console.log('sum', 1 + 2)\nreturn 'done'", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(out.output, "sum 3\ndone");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_canvas_capability() {
        let backend = InterpreterBackend::new(ExecutionRegistry::new());
        let mut job = job("return createCanvas().width", Duration::from_secs(5));
        job.capabilities.insert(Capability::Canvas);
        let out = backend.run(&job).await.unwrap();
        assert_eq!(out.output, "800");
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let registry = ExecutionRegistry::new();
        let backend = InterpreterBackend::new(registry.clone());
        let started = Instant::now();
        let err = backend
            .run(&job("while true do end", Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(err.to_string().to_lowercase().contains("timeout"));
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert!(registry.is_empty());
    }
}
