//! Sandbox service
//!
//! Entry point for callers: validation, limit resolution, admission, dispatch,
//! status, termination and the reaper lifecycle.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{validate_sandbox_config, SandboxConfig};
use crate::error::{Error, Result};
use crate::sandbox::container::ContainerBackend;
use crate::sandbox::dispatcher::TierDispatcher;
use crate::sandbox::executor::{
    ExecutionJob, ExecutionRequest, ExecutionResult, ExecutionStatus, Language, SecurityLevel,
};
use crate::sandbox::governor::ResourceGovernor;
use crate::sandbox::interpreter::InterpreterBackend;
use crate::sandbox::isolate::IsolateBackend;
use crate::sandbox::reaper::{Reaper, ReaperHandle};
use crate::sandbox::registry::{ExecutionRegistry, QueueGuard};
use crate::sandbox::result::{assemble, ExecutionContext};
use crate::sandbox::runtime::{ContainerRuntime, DockerRuntime};
use crate::sandbox::validator::Validator;
use crate::sandbox::worker::WorkerBackend;

/// Availability of one configured container image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStatus {
    pub language: Language,
    pub image: String,
    pub available: bool,
    pub pulled: bool,
}

/// Multi-tier code execution service
#[derive(Clone)]
pub struct SandboxService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: SandboxConfig,
    validator: Validator,
    governor: ResourceGovernor,
    dispatcher: TierDispatcher,
    registry: Arc<ExecutionRegistry>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    admission: Arc<Semaphore>,
    reaper: Mutex<Option<ReaperHandle>>,
}

impl SandboxService {
    /// Connect to Docker and start the service. An unreachable daemon only
    /// disables the maximum tier.
    pub async fn new(config: SandboxConfig) -> Result<Self> {
        let runtime = match DockerRuntime::connect(&config.container).await {
            Ok(runtime) => Some(Arc::new(runtime) as Arc<dyn ContainerRuntime>),
            Err(e) => {
                warn!("Container tier unavailable: {}", e);
                None
            }
        };
        let has_runtime = runtime.is_some();
        let service = Self::with_runtime(config, runtime)?;

        if has_runtime {
            match service.check_images().await {
                Ok(report) => {
                    let missing = report.iter().filter(|s| !s.available).count();
                    info!(images = report.len(), missing, "Container images checked");
                }
                Err(e) => warn!("Container image check failed: {}", e),
            }
        }
        Ok(service)
    }

    /// Build the service around an explicit container runtime.
    /// Must be called inside a tokio runtime when the reaper is enabled.
    pub fn with_runtime(
        config: SandboxConfig,
        runtime: Option<Arc<dyn ContainerRuntime>>,
    ) -> Result<Self> {
        let validation = validate_sandbox_config(&config);
        for issue in &validation.warnings {
            warn!("Config warning: {}", issue);
        }
        if !validation.valid {
            let errors: Vec<String> = validation.errors.iter().map(ToString::to_string).collect();
            return Err(Error::Config(format!(
                "Invalid sandbox configuration: {}",
                errors.join("; ")
            )));
        }

        let validator = Validator::new(config.max_code_chars)?;
        let governor = ResourceGovernor::new(&config.tiers, &config.environment)?;
        let registry = ExecutionRegistry::new();

        let dispatcher = TierDispatcher::new(
            Box::new(ContainerBackend::new(
                runtime.clone(),
                config.container.clone(),
                registry.clone(),
            )),
            Box::new(IsolateBackend::new(registry.clone())),
            Box::new(InterpreterBackend::new(registry.clone())),
            Box::new(WorkerBackend::new(registry.clone())),
        );

        let reaper = config
            .reaper
            .enabled
            .then(|| Reaper::new(registry.clone(), config.reaper.clone()).start());

        info!(
            max_concurrent = config.max_concurrent_executions,
            default_tier = %config.default_security_level,
            container_tier = runtime.is_some(),
            rules = validator.rules().len(),
            "Sandbox service started"
        );

        Ok(SandboxService {
            inner: Arc::new(ServiceInner {
                admission: Arc::new(Semaphore::new(config.max_concurrent_executions)),
                config,
                validator,
                governor,
                dispatcher,
                registry,
                runtime,
                reaper: Mutex::new(reaper),
            }),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Accept a request and return its id right away
    pub fn submit(&self, request: ExecutionRequest) -> PendingExecution {
        let id = Uuid::new_v4();
        let level = request.level_or(self.inner.config.default_security_level);
        let ctx = ExecutionContext::new(id, request.language, level);

        let job = match self.inner.prepare(id, &request, level) {
            Ok(job) => job,
            Err(e) => {
                return PendingExecution {
                    id,
                    state: PendingState::Ready(Box::new(assemble(&ctx, Err(e)))),
                }
            }
        };

        let queue = self.inner.registry.enqueue(id);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.run_admitted(&ctx, job, queue).await });

        PendingExecution {
            id,
            state: PendingState::Running { task, ctx },
        }
    }

    /// Run one request to completion. Per-request failures are reported in
    /// the result, never as an `Err`.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        self.submit(request).wait().await
    }

    pub fn status(&self, id: Uuid) -> ExecutionStatus {
        self.inner.registry.status(id)
    }

    /// Stop a queued or running execution. `false` when the id is unknown or
    /// already finished.
    pub async fn terminate(&self, id: Uuid) -> bool {
        self.inner.registry.terminate(id).await
    }

    /// Running plus queued executions
    pub fn active_executions(&self) -> usize {
        self.inner.registry.len()
    }

    /// Check every configured image, pulling missing ones when enabled
    pub async fn check_images(&self) -> Result<Vec<ImageStatus>> {
        let runtime = self
            .inner
            .runtime
            .as_ref()
            .ok_or_else(|| Error::Container("container runtime unavailable".to_string()))?;
        let container = &self.inner.config.container;

        let mut report = Vec::new();
        for (language, lang_runtime) in container.runtimes.all() {
            let image = lang_runtime.image.clone();
            let mut available = runtime.image_available(&image).await?;
            let mut pulled = false;

            if !available {
                if container.pull_missing_images {
                    match runtime.pull_image(&image).await {
                        Ok(()) => {
                            available = true;
                            pulled = true;
                        }
                        Err(e) => warn!(%language, %image, "Image pull failed: {}", e),
                    }
                } else {
                    warn!(%language, %image, "Container image missing");
                }
            }

            report.push(ImageStatus {
                language,
                image,
                available,
                pulled,
            });
        }
        Ok(report)
    }

    /// Stop the reaper and terminate everything still registered.
    /// Later requests fail as terminated.
    pub async fn shutdown(&self) {
        self.inner.admission.close();

        let reaper = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            reaper.shutdown().await;
        }

        let stopped = self.inner.registry.terminate_all().await;
        info!(stopped, "Sandbox service shut down");
    }
}

impl ServiceInner {
    /// Validate, resolve limits and sanitise the environment
    fn prepare(
        &self,
        id: Uuid,
        request: &ExecutionRequest,
        level: SecurityLevel,
    ) -> Result<ExecutionJob> {
        self.validator.validate(request)?;
        let limits = self.governor.resolve_limits(request, level)?;
        let environment = self
            .governor
            .sanitize_environment(&request.environment_variables);

        Ok(ExecutionJob {
            id,
            code: request.code.clone(),
            language: request.language,
            security_level: level,
            limits,
            capabilities: request.capabilities.clone(),
            environment,
            max_output_bytes: self.config.max_output_bytes,
        })
    }

    /// Wait for a slot, leave the queue and dispatch
    async fn run_admitted(
        &self,
        ctx: &ExecutionContext,
        job: ExecutionJob,
        queue: QueueGuard,
    ) -> ExecutionResult {
        let cancel = queue.cancel_token();
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.admission.clone().acquire_owned() => permit.ok(),
        };

        let Some(permit) = permit else {
            return assemble(ctx, Err(Error::Terminated));
        };
        if !queue.dequeue() {
            return assemble(ctx, Err(Error::Terminated));
        }

        let result = self.dispatcher.dispatch(ctx, &job).await;

        // A draining engine keeps its slot until the thread is gone
        if let Some(released) = self.registry.released(job.id) {
            debug!(execution_id = %job.id, "Holding admission slot for draining engine");
            tokio::spawn(async move {
                released.cancelled().await;
                drop(permit);
            });
        }
        result
    }
}

/// A submitted execution
pub struct PendingExecution {
    id: Uuid,
    state: PendingState,
}

enum PendingState {
    /// Rejected before admission
    Ready(Box<ExecutionResult>),
    Running {
        task: JoinHandle<ExecutionResult>,
        ctx: ExecutionContext,
    },
}

impl PendingExecution {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn wait(self) -> ExecutionResult {
        match self.state {
            PendingState::Ready(result) => *result,
            PendingState::Running { task, ctx } => match task.await {
                Ok(result) => result,
                Err(e) => assemble(
                    &ctx,
                    Err(Error::Internal(format!("execution task failed: {}", e))),
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::{Duration, Instant};

    fn service_with(configure: impl FnOnce(&mut SandboxConfig)) -> SandboxService {
        let mut config = SandboxConfig::default();
        configure(&mut config);
        SandboxService::with_runtime(config, None).unwrap()
    }

    fn service() -> SandboxService {
        service_with(|_| {})
    }

    async fn wait_until_running(service: &SandboxService, id: Uuid) {
        for _ in 0..400 {
            let status = service.status(id);
            if status.is_active() && !status.queued_execution {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("execution {id} never started");
    }

    #[tokio::test]
    async fn test_low_tier_return_value() {
        let service = service();
        let request = ExecutionRequest::new("return 2+2", Language::JavaScript)
            .with_security_level(SecurityLevel::Low);
        let result = service.execute(request).await;
        assert!(result.success, "{}", result.error);
        assert_eq!(result.output, "4");
        assert_eq!(result.metadata.security_level, SecurityLevel::Low);
    }

    #[tokio::test]
    async fn test_denylisted_code_rejected_on_every_tier() {
        let service = service();
        for level in SecurityLevel::ALL {
            let request =
                ExecutionRequest::new("require('fs').readFileSync('/etc/passwd')", Language::JavaScript)
                    .with_security_level(level);
            let result = service.execute(request).await;
            assert!(!result.success);
            assert_eq!(result.error_kind, Some(ErrorKind::Validation), "{level}");
        }
        assert_eq!(service.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_high_tier_infinite_loop_times_out() {
        let service = service();
        let request = ExecutionRequest::new("while(true){}", Language::JavaScript)
            .with_security_level(SecurityLevel::High)
            .with_timeout(Duration::from_millis(200));

        let started = Instant::now();
        let pending = service.submit(request);
        let id = pending.id();
        let result = pending.wait().await;

        assert!(!result.success);
        assert!(result.error.contains("timeout"));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert!(!service.status(id).is_active());
        assert_eq!(service.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_medium_tier_infinite_loop_times_out() {
        let service = service();
        let request = ExecutionRequest::new("while true do end", Language::Lua)
            .with_security_level(SecurityLevel::Medium)
            .with_timeout(Duration::from_millis(200));
        let result = service.execute(request).await;
        assert!(result.timed_out());
        assert_eq!(service.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_unknown_status() {
        let service = service();
        assert_eq!(service.status(Uuid::new_v4()), ExecutionStatus::default());
        assert!(!service.terminate(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_terminate_running_is_idempotent() {
        let service = service();
        let request = ExecutionRequest::new("while(true){}", Language::JavaScript)
            .with_security_level(SecurityLevel::Low)
            .with_timeout(Duration::from_secs(30));

        let pending = service.submit(request);
        let id = pending.id();
        wait_until_running(&service, id).await;
        assert!(service.status(id).worker_active);

        assert!(service.terminate(id).await);
        assert!(!service.terminate(id).await);

        let result = pending.wait().await;
        assert_eq!(result.error_kind, Some(ErrorKind::Terminated));
        assert!(!service.terminate(id).await);
        assert_eq!(service.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_terminate_after_completion_returns_false() {
        let service = service();
        let pending = service.submit(
            ExecutionRequest::new("return 1", Language::JavaScript)
                .with_security_level(SecurityLevel::Low),
        );
        let id = pending.id();
        assert!(pending.wait().await.success);
        assert!(!service.terminate(id).await);
    }

    #[tokio::test]
    async fn test_queued_execution_can_be_terminated() {
        let service = service_with(|c| c.max_concurrent_executions = 1);
        let long = ExecutionRequest::new("while(true){}", Language::JavaScript)
            .with_security_level(SecurityLevel::Low)
            .with_timeout(Duration::from_secs(30));

        let first = service.submit(long.clone());
        wait_until_running(&service, first.id()).await;

        let second = service.submit(long);
        let second_id = second.id();
        assert!(service.status(second_id).queued_execution);

        assert!(service.terminate(second_id).await);
        let result = second.wait().await;
        assert_eq!(result.error_kind, Some(ErrorKind::Terminated));

        assert!(service.terminate(first.id()).await);
        assert_eq!(first.wait().await.error_kind, Some(ErrorKind::Terminated));
        assert_eq!(service.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_isolates_do_not_share_state() {
        let service = service();
        let high = |code: &str| {
            ExecutionRequest::new(code, Language::JavaScript).with_security_level(SecurityLevel::High)
        };

        let first = service.submit(high("globalThis.marker = 'first'; Object.prototype.leak = 1; typeof other"));
        let second = service.submit(high("globalThis.other = 'second'; [typeof marker, typeof ({}).leak].join(',')"));
        let (first, second) = tokio::join!(first.wait(), second.wait());

        assert!(first.success, "{}", first.error);
        assert!(second.success, "{}", second.error);
        assert_eq!(first.output, "undefined");
        assert_eq!(second.output, "undefined,undefined");
        assert_eq!(service.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_isolates_do_not_share_state() {
        let service = service();
        let high = |code: &str| {
            ExecutionRequest::new(code, Language::JavaScript).with_security_level(SecurityLevel::High)
        };

        let first = service.execute(high("var shared = 41; shared + 1")).await;
        assert_eq!(first.output, "42");
        let second = service.execute(high("typeof shared")).await;
        assert_eq!(second.output, "undefined");
    }

    #[tokio::test]
    async fn test_maximum_tier_without_docker_is_backend_fault() {
        let service = service();
        let request = ExecutionRequest::new("print('hi')", Language::Python)
            .with_security_level(SecurityLevel::Maximum);
        let result = service.execute(request).await;
        assert_eq!(result.error_kind, Some(ErrorKind::BackendFault));
        tokio_test::assert_err!(service.check_images().await);
    }

    #[tokio::test]
    async fn test_medium_tier_runs_javascript() {
        let service = service();
        let request = ExecutionRequest::new("console.log('hi'); [typeof eval, 1 + 1].join(' ')", Language::JavaScript)
            .with_security_level(SecurityLevel::Medium);
        let result = service.execute(request).await;
        assert!(result.success, "{}", result.error);
        assert_eq!(result.output, "hi\nundefined 2");
        assert_eq!(service.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_medium_tier_javascript_loop_times_out() {
        let service = service();
        let request = ExecutionRequest::new("while(true){}", Language::JavaScript)
            .with_security_level(SecurityLevel::Medium)
            .with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let result = service.execute(request).await;
        assert!(result.timed_out());
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(service.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_medium_tier_lua_backtracking_pattern_fails_fast() {
        let service = service();
        let request = ExecutionRequest::new(
            "return string.find(string.rep('a', 300), '.-.-.-b')",
            Language::Lua,
        )
        .with_security_level(SecurityLevel::Medium)
        .with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let result = service.execute(request).await;
        assert_eq!(result.error_kind, Some(ErrorKind::ScriptRuntime));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(service.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_memory_ceiling_on_in_process_tiers() {
        let service = service();
        let hog = "const parts = []; for (;;) { parts.push('y'.repeat(1 << 20) + parts.length); }";
        for level in [SecurityLevel::High, SecurityLevel::Medium, SecurityLevel::Low] {
            let request = ExecutionRequest::new(hog, Language::JavaScript)
                .with_security_level(level)
                .with_memory(16 * 1024 * 1024);
            let result = service.execute(request).await;
            assert!(!result.success, "{level}");
            assert_eq!(result.error_kind, Some(ErrorKind::ResourceLimit), "{level}: {}", result.error);
        }

        let request = ExecutionRequest::new(
            "local t = {}\nfor i = 1, 1e8 do t[i] = string.rep('x', 64) .. i end",
            Language::Lua,
        )
        .with_security_level(SecurityLevel::Medium)
        .with_memory(4 * 1024 * 1024);
        let result = service.execute(request).await;
        assert_eq!(result.error_kind, Some(ErrorKind::ResourceLimit), "{}", result.error);
        assert_eq!(service.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_unset_level_uses_configured_default() {
        let service = service_with(|c| c.default_security_level = SecurityLevel::Low);
        let result = service
            .execute(ExecutionRequest::new("return 2+2", Language::JavaScript))
            .await;
        assert!(result.success, "{}", result.error);
        assert_eq!(result.output, "4");
        assert_eq!(result.metadata.security_level, SecurityLevel::Low);
    }

    #[tokio::test]
    async fn test_unsupported_language_for_tier() {
        let service = service();
        let request = ExecutionRequest::new("print(1)", Language::Python)
            .with_security_level(SecurityLevel::Medium);
        let result = service.execute(request).await;
        assert_eq!(result.error_kind, Some(ErrorKind::BackendFault));
        assert_eq!(service.active_executions(), 0);
    }

    #[tokio::test]
    async fn test_invalid_override_is_validation_error() {
        let service = service();
        let request = ExecutionRequest::new("return 1", Language::JavaScript)
            .with_security_level(SecurityLevel::Low)
            .with_cpu_share(-1.0);
        let result = service.execute(request).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let service = service();
        service.shutdown().await;
        let result = service
            .execute(
                ExecutionRequest::new("return 1", Language::JavaScript)
                    .with_security_level(SecurityLevel::Low),
            )
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Terminated));
    }

    #[test]
    fn test_invalid_tier_limits_rejected() {
        let mut config = SandboxConfig::default();
        config.reaper.enabled = false;
        config.tiers.maximum.cpu_share = 0.0;
        assert!(matches!(
            SandboxService::with_runtime(config, None),
            Err(Error::Config(message)) if message.contains("cpu_share")
        ));

        let mut config = SandboxConfig::default();
        config.reaper.enabled = false;
        config.tiers.high.max_cpu_share = 1.5;
        assert!(matches!(
            SandboxService::with_runtime(config, None),
            Err(Error::Config(message)) if message.contains("high.max_cpu_share")
        ));

        let mut config = SandboxConfig::default();
        config.reaper.enabled = false;
        config.tiers.low.timeout = Duration::ZERO;
        assert!(matches!(
            SandboxService::with_runtime(config, None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = SandboxConfig::default();
        config.max_concurrent_executions = 0;
        config.reaper.enabled = false;
        assert!(matches!(
            SandboxService::with_runtime(config, None),
            Err(Error::Config(_))
        ));
    }
}
