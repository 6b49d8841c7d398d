//! Turns a backend outcome into the caller-facing [`ExecutionResult`]

use chrono::Utc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::sandbox::executor::{
    ExecutionMetadata, ExecutionResult, Language, ResourceUsage, ScriptOutput, SecurityLevel,
};

/// Identity and start time of one execution
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    pub id: Uuid,
    pub language: Language,
    pub security_level: SecurityLevel,
    started: Instant,
}

impl ExecutionContext {
    pub fn new(id: Uuid, language: Language, security_level: SecurityLevel) -> Self {
        ExecutionContext {
            id,
            language,
            security_level,
            started: Instant::now(),
        }
    }

    fn metadata(&self, resource_usage: ResourceUsage) -> ExecutionMetadata {
        ExecutionMetadata {
            execution_id: self.id,
            language: self.language,
            security_level: self.security_level,
            timestamp: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            resource_usage,
        }
    }
}

/// Build the result and log the outcome
pub fn assemble(ctx: &ExecutionContext, outcome: Result<ScriptOutput>) -> ExecutionResult {
    match outcome {
        Ok(out) => {
            let metadata = ctx.metadata(out.resource_usage);
            info!(
                execution_id = %ctx.id,
                tier = %ctx.security_level,
                language = %ctx.language,
                duration_ms = metadata.duration_ms,
                "Execution succeeded"
            );
            ExecutionResult::success(out.output, metadata)
        }
        Err(e) => failure(ctx, e),
    }
}

fn failure(ctx: &ExecutionContext, err: Error) -> ExecutionResult {
    let kind = err.kind();
    let metadata = ctx.metadata(ResourceUsage::default());

    match kind {
        ErrorKind::BackendFault => warn!(
            execution_id = %ctx.id,
            tier = %ctx.security_level,
            language = %ctx.language,
            "Backend fault: {}", err
        ),
        // already logged on the security target
        ErrorKind::Validation => {}
        _ => info!(
            execution_id = %ctx.id,
            tier = %ctx.security_level,
            language = %ctx.language,
            kind = %kind,
            duration_ms = metadata.duration_ms,
            "Execution failed: {}", err
        ),
    }

    let output = match err {
        Error::Script { ref output, .. } => output.clone(),
        _ => String::new(),
    };
    ExecutionResult::failure(kind, err.to_string(), output, metadata)
}
