//! Isolated-heap execution
//!
//! High tier. A fresh V8 isolate per execution with its own heap ceiling and a
//! hardened global scope: only `log` and the requested capability stand-ins.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sandbox::engine::js::{self, JsMode, JsTask};
use crate::sandbox::engine::supervise;
use crate::sandbox::executor::{ExecutionJob, IsolationBackend, Language, ScriptOutput};
use crate::sandbox::registry::{BackendKind, ExecutionRegistry};

/// V8 isolate backend
pub struct IsolateBackend {
    registry: Arc<ExecutionRegistry>,
}

impl IsolateBackend {
    pub fn new(registry: Arc<ExecutionRegistry>) -> Self {
        IsolateBackend { registry }
    }
}

#[async_trait]
impl IsolationBackend for IsolateBackend {
    fn name(&self) -> &str {
        "isolate"
    }

    fn supports_language(&self, language: Language) -> bool {
        language == Language::JavaScript
    }

    async fn run(&self, job: &ExecutionJob) -> Result<ScriptOutput> {
        let task = JsTask {
            code: job.code.clone(),
            mode: JsMode::Isolated,
            heap_limit_bytes: job.limits.memory_bytes,
            capabilities: job.capabilities.clone(),
            max_output_bytes: job.max_output_bytes,
        };

        supervise(&self.registry, BackendKind::Isolate, job, Error::Isolate, |control| {
            js::spawn(job.id, task, control)
        })
        .await
    }
}
