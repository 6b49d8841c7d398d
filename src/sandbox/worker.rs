//! Worker-thread execution
//!
//! Low tier. The script runs on its own OS thread in this process with no
//! isolation beyond the thread boundary. JavaScript code is a function body,
//! so `return 2+2` yields `4`. Lua gets the regular standard library.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sandbox::engine::js::{self, JsMode, JsTask};
use crate::sandbox::engine::lua::{self, LuaMode, LuaTask};
use crate::sandbox::engine::supervise;
use crate::sandbox::executor::{ExecutionJob, IsolationBackend, Language, ScriptOutput};
use crate::sandbox::registry::{BackendKind, ExecutionRegistry};

/// Worker thread backend
pub struct WorkerBackend {
    registry: Arc<ExecutionRegistry>,
}

impl WorkerBackend {
    pub fn new(registry: Arc<ExecutionRegistry>) -> Self {
        WorkerBackend { registry }
    }
}

#[async_trait]
impl IsolationBackend for WorkerBackend {
    fn name(&self) -> &str {
        "worker"
    }

    fn supports_language(&self, language: Language) -> bool {
        matches!(language, Language::JavaScript | Language::Lua)
    }

    async fn run(&self, job: &ExecutionJob) -> Result<ScriptOutput> {
        match job.language {
            Language::JavaScript => {
                let task = JsTask {
                    code: job.code.clone(),
                    mode: JsMode::Worker,
                    heap_limit_bytes: job.limits.memory_bytes,
                    capabilities: job.capabilities.clone(),
                    max_output_bytes: job.max_output_bytes,
                };
                supervise(&self.registry, BackendKind::Worker, job, Error::Worker, |control| {
                    js::spawn(job.id, task, control)
                })
                .await
            }
            Language::Lua => {
                let task = LuaTask {
                    code: job.code.clone(),
                    mode: LuaMode::Full,
                    memory_limit_bytes: job.limits.memory_bytes,
                    timeout: job.limits.timeout,
                    capabilities: job.capabilities.clone(),
                    max_output_bytes: job.max_output_bytes,
                };
                supervise(&self.registry, BackendKind::Worker, job, Error::Worker, |control| {
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
