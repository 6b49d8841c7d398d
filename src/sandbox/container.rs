//! Docker container-based execution
//!
//! Maximum tier. Every execution gets a fresh container with no network, a
//! read-only root filesystem, the code bound read-only at `/sandbox` and a
//! small `noexec` tmpfs for `/tmp`.

use async_trait::async_trait;
use futures::StreamExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::config::ContainerConfig;
use crate::error::{Error, Result};
use crate::sandbox::executor::{
    ExecutionJob, IsolationBackend, Language, OutputBuffer, ResourceUsage, ScriptOutput,
};
use crate::sandbox::registry::{BackendKind, BackendResource, ExecutionRegistry};
use crate::sandbox::runtime::{ContainerRuntime, ContainerSpec, CODE_MOUNT};

/// Environment every container starts with, before caller variables
const BASE_ENV: &[(&str, &str)] = &[
    ("NODE_ENV", "sandbox"),
    ("PYTHONPATH", CODE_MOUNT),
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("HOME", "/tmp"),
];

/// Docker container backend
pub struct ContainerBackend {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    config: ContainerConfig,
    registry: Arc<ExecutionRegistry>,
}

impl ContainerBackend {
    /// `runtime` is `None` when Docker was unreachable at startup
    pub fn new(
        runtime: Option<Arc<dyn ContainerRuntime>>,
        config: ContainerConfig,
        registry: Arc<ExecutionRegistry>,
    ) -> Self {
        ContainerBackend {
            runtime,
            config,
            registry,
        }
    }

    fn container_spec(&self, job: &ExecutionJob, code_dir: &Path) -> ContainerSpec {
        let runtime = self.config.runtimes.for_language(job.language);

        let mut command = runtime.command.clone();
        command.push(format!("{}/{}", CODE_MOUNT, runtime.file));

        let env = BASE_ENV
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .chain(job.environment.iter().map(|(k, v)| format!("{}={}", k, v)))
            .collect();

        ContainerSpec {
            name: format!("{}-{}", self.config.name_prefix, job.id),
            image: runtime.image.clone(),
            command,
            env,
            code_dir: code_dir.to_path_buf(),
            memory_bytes: job.limits.memory_bytes,
            cpu_period: self.config.cpu_period,
            cpu_quota: (job.limits.cpu_share * self.config.cpu_period as f64).round() as i64,
            network: self.config.network.clone(),
            user: self.config.user.clone(),
            pids_limit: self.config.pids_limit,
            nofile: self.config.nofile,
            nproc: self.config.nproc,
            tmpfs_size: self.config.tmpfs_size.clone(),
        }
    }

    /// Write the code into a fresh directory readable by the container user
    async fn stage_code(&self, job: &ExecutionJob) -> Result<TempDir> {
        let file = &self.config.runtimes.for_language(job.language).file;
        let dir = tempfile::Builder::new().prefix("sandbox-").tempdir()?;
        let path = dir.path().join(file);

        tokio::fs::write(&path, &job.code).await?;
        tokio::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).await?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;

        Ok(dir)
    }

    /// Attach, start, collect output and exit status
    async fn drive(
        runtime: &dyn ContainerRuntime,
        name: &str,
        max_output_bytes: usize,
        memory_bytes: u64,
    ) -> Result<ScriptOutput> {
        let mut stream = runtime.attach(name).await?;
        runtime.start(name).await?;

        let mut buffer = OutputBuffer::new(max_output_bytes);
        while let Some(chunk) = stream.next().await {
            buffer.push_str(&chunk?);
        }

        let exit_code = runtime.wait(name).await?;
        let state = runtime.inspect(name).await?;
        if state.oom_killed {
            return Err(Error::MemoryLimit {
                limit_bytes: memory_bytes,
            });
        }

        let resource_usage = match runtime.stats(name).await {
            Ok(usage) => usage,
            Err(e) => {
                debug!(container = %name, "Stats unavailable: {}", e);
                ResourceUsage::default()
            }
        };

        let output = buffer.into_string();
        if exit_code != 0 {
            return Err(Error::Script {
                message: format!("Process exited with code {}", exit_code),
                output,
            });
        }

        Ok(ScriptOutput {
            output,
            resource_usage,
        })
    }

    /// Best-effort kill and remove, errors are only logged
    async fn cleanup(runtime: &dyn ContainerRuntime, name: &str, kill: bool) {
        if kill {
            if let Err(e) = runtime.kill(name).await {
                debug!(container = %name, "Kill failed: {}", e);
            }
        }
        if let Err(e) = runtime.remove(name).await {
            warn!(container = %name, "Failed to remove container: {}", e);
        }
    }
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn name(&self) -> &str {
        "container"
    }

    fn supports_language(&self, _language: Language) -> bool {
        true
    }

    async fn run(&self, job: &ExecutionJob) -> Result<ScriptOutput> {
        let runtime = self
            .runtime
            .clone()
            .ok_or_else(|| Error::Container("container runtime unavailable".to_string()))?;

        let code_dir = self.stage_code(job).await?;
        let spec = self.container_spec(job, code_dir.path());
        let deadline = tokio::time::Instant::now() + job.limits.timeout;
        let timeout = || Error::Timeout {
            timeout_ms: job.limits.timeout_ms(),
        };

        let created = tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => Err(timeout()),
            created = runtime.create(&spec) => created,
        };
        if let Err(e) = created {
            Self::cleanup(runtime.as_ref(), &spec.name, true).await;
            return Err(e);
        }

        let guard = self.registry.register(
            job.id,
            BackendKind::Container,
            BackendResource::Container {
                name: spec.name.clone(),
                runtime: runtime.clone(),
            },
        );
        let cancel = guard.cancel_token();

        let outcome = tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => {
                warn!(execution_id = %job.id, timeout_ms = job.limits.timeout_ms(), "Container execution timed out");
                Err(timeout())
            }
            _ = cancel.cancelled() => Err(Error::Terminated),
            outcome = Self::drive(runtime.as_ref(), &spec.name, job.max_output_bytes, job.limits.memory_bytes) => outcome,
        };

        // terminate() already stopped the container when it won the race
        let owned = guard.finish();
        if owned {
            Self::cleanup(runtime.as_ref(), &spec.name, outcome.is_err()).await;
        }
        drop(code_dir);

        if !owned {
            return Err(Error::Terminated);
        }
        outcome
    }
}
