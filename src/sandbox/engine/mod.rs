//! In-process script engines
//!
//! V8 and Lua states are `!Send`, so every execution gets its own OS thread
//! that creates, runs and drops the engine. The async side waits on a oneshot
//! and stops the thread through a [`ThreadControl`]. A thread that ignores the
//! stop request stays registered until it actually exits.

pub mod js;
pub mod lua;
mod prelude;
pub mod quickjs;
mod stubs;

use deno_core::v8;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::sandbox::executor::{ExecutionJob, ScriptOutput};
use crate::sandbox::registry::{BackendKind, BackendResource, ExecutionRegistry};

/// Shared stop switch and liveness flag for one engine thread
#[derive(Clone, Default)]
pub struct ThreadControl {
    inner: Arc<ControlInner>,
}

/// How long an interrupted engine gets to unwind before it is left draining
const EXIT_GRACE: Duration = Duration::from_millis(250);

#[derive(Default)]
struct ControlInner {
    interrupted: AtomicBool,
    exited: CancellationToken,
    isolate: Mutex<Option<v8::IsolateHandle>>,
}

impl std::fmt::Debug for ThreadControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadControl")
            .field("interrupted", &self.is_interrupted())
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl ThreadControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the engine to stop. Lua and QuickJS poll the flag; V8 is terminated directly.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        let isolate = self
            .inner
            .isolate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = isolate.as_ref() {
            handle.terminate_execution();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Whether the engine thread has finished
    pub fn has_exited(&self) -> bool {
        self.inner.exited.is_cancelled()
    }

    /// Resolves once the engine thread has finished
    pub async fn exited(&self) {
        self.inner.exited.cancelled().await
    }

    pub(crate) fn attach_isolate(&self, handle: v8::IsolateHandle) {
        let mut isolate = self
            .inner
            .isolate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_interrupted() {
            handle.terminate_execution();
        }
        *isolate = Some(handle);
    }

    pub(crate) fn detach_isolate(&self) {
        self.inner
            .isolate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Marks the thread as exited when dropped, including on panic
struct ExitGuard(ThreadControl);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.detach_isolate();
        self.0.inner.exited.cancel();
    }
}

/// Run `body` on a dedicated named thread and report through a oneshot
pub(crate) fn spawn_engine<F>(
    thread_name: String,
    control: ThreadControl,
    fault: fn(String) -> Error,
    body: F,
) -> Result<oneshot::Receiver<Result<ScriptOutput>>>
where
    F: FnOnce(&ThreadControl) -> Result<ScriptOutput> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let _exit = ExitGuard(control.clone());
            let cpu_start = thread_cpu_time();
            let mut result = body(&control);
            if let Ok(ref mut output) = result {
                output.resource_usage.cpu_time_ns =
                    thread_cpu_time().saturating_sub(cpu_start).as_nanos() as u64;
            }
            if tx.send(result).is_err() {
                debug!("Engine result dropped, caller already finished");
            }
        })
        .map_err(|e| fault(format!("failed to spawn engine thread: {}", e)))?;

    Ok(rx)
}

/// Race the engine's report against the timeout and cancellation.
/// The timer arm is polled first so a timeout wins ties.
pub(crate) async fn await_engine(
    rx: oneshot::Receiver<Result<ScriptOutput>>,
    timeout: Duration,
    cancel: &CancellationToken,
    control: &ThreadControl,
    fault: fn(String) -> Error,
) -> Result<ScriptOutput> {
    tokio::select! {
        biased;
        _ = tokio::time::sleep(timeout) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Execution timed out, interrupting engine");
            control.interrupt();
            Err(Error::Timeout { timeout_ms: timeout.as_millis() as u64 })
        }
        _ = cancel.cancelled() => {
            control.interrupt();
            Err(Error::Terminated)
        }
        reported = rx => match reported {
            Ok(result) => result,
            Err(_) => Err(fault("engine thread exited without reporting".to_string())),
        },
    }
}

/// Spawn an engine thread, register it and wait for its outcome.
///
/// On timeout or termination the thread gets [`EXIT_GRACE`] to unwind. If it
/// is still busy after that (a long native call, for instance) the result is
/// returned anyway and the handle stays registered as draining until the
/// thread exits.
pub(crate) async fn supervise<S>(
    registry: &Arc<ExecutionRegistry>,
    kind: BackendKind,
    job: &ExecutionJob,
    fault: fn(String) -> Error,
    spawn: S,
) -> Result<ScriptOutput>
where
    S: FnOnce(ThreadControl) -> Result<oneshot::Receiver<Result<ScriptOutput>>>,
{
    let control = ThreadControl::new();
    let rx = spawn(control.clone())?;

    let guard = registry.register(job.id, kind, BackendResource::Thread(control.clone()));
    let cancel = guard.cancel_token();
    let outcome = await_engine(rx, job.limits.timeout, &cancel, &control, fault).await;

    let stopped = matches!(outcome, Err(Error::Timeout { .. }) | Err(Error::Terminated));
    if stopped
        && !control.has_exited()
        && tokio::time::timeout(EXIT_GRACE, control.exited()).await.is_err()
    {
        warn!(
            execution_id = %job.id,
            backend = %kind,
            "Engine thread still running after interrupt, keeping it registered"
        );
        let (owned, drain) = guard.drain();
        let id = job.id;
        tokio::spawn(async move {
            control.exited().await;
            drop(drain);
            info!(execution_id = %id, "Draining engine thread exited");
        });
        return if owned { outcome } else { Err(Error::Terminated) };
    }

    if !guard.finish() {
        return Err(Error::Terminated);
    }
    outcome
}

/// CPU time consumed by the calling thread
pub(crate) fn thread_cpu_time() -> Duration {
    use nix::time::{clock_gettime, ClockId};

    match clock_gettime(ClockId::CLOCK_THREAD_CPUTIME_ID) {
        Ok(ts) => Duration::new(ts.tv_sec().max(0) as u64, ts.tv_nsec().max(0) as u32),
        Err(_) => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_flag_set_after_thread_finishes() {
        let control = ThreadControl::new();
        let rx = spawn_engine("test-engine".into(), control.clone(), Error::Worker, |_| {
            Ok(ScriptOutput::default())
        })
        .unwrap();

        let result = rx.await.unwrap();
        assert!(result.is_ok());
        // guard drops right after the send
        for _ in 0..100 {
            if control.has_exited() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(control.has_exited());
    }

    #[tokio::test]
    async fn test_timeout_wins_and_interrupts() {
        let control = ThreadControl::new();
        let cancel = CancellationToken::new();
        let (_tx, rx) = oneshot::channel::<Result<ScriptOutput>>();

        let err = await_engine(rx, Duration::from_millis(20), &cancel, &control, Error::Worker)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 20 }));
        assert!(control.is_interrupted());
    }

    #[tokio::test]
    async fn test_cancel_reports_terminated() {
        let control = ThreadControl::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_tx, rx) = oneshot::channel::<Result<ScriptOutput>>();

        let err = await_engine(rx, Duration::from_secs(5), &cancel, &control, Error::Worker)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Terminated));
    }

    fn job(timeout: Duration) -> ExecutionJob {
        use crate::sandbox::executor::{ExecutionLimits, Language, SecurityLevel};

        ExecutionJob {
            id: uuid::Uuid::new_v4(),
            code: String::new(),
            language: Language::Lua,
            security_level: SecurityLevel::Medium,
            limits: ExecutionLimits {
                memory_bytes: 1024 * 1024,
                cpu_share: 0.5,
                timeout,
            },
            capabilities: Default::default(),
            environment: Vec::new(),
            max_output_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_unresponsive_engine_drains_until_exit() {
        let registry = ExecutionRegistry::new();
        let job = job(Duration::from_millis(50));
        let started = std::time::Instant::now();

        let err = supervise(&registry, BackendKind::Interpreter, &job, Error::Interpreter, |control| {
            spawn_engine("test-stubborn".into(), control, Error::Interpreter, |_| {
                // ignores the interrupt flag, like a long native call
                std::thread::sleep(Duration::from_millis(900));
                Ok(ScriptOutput::default())
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout { timeout_ms: 50 }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_millis(800));
        assert!(registry.status(job.id).interpreter_active);
        assert!(!registry.terminate(job.id).await);

        let released = registry.released(job.id).unwrap();
        tokio::time::timeout(Duration::from_secs(5), released.cancelled())
            .await
            .unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_responsive_engine_deregisters_on_timeout() {
        let registry = ExecutionRegistry::new();
        let job = job(Duration::from_millis(50));

        let err = supervise(&registry, BackendKind::Worker, &job, Error::Worker, |control| {
            spawn_engine("test-polite".into(), control, Error::Worker, |control| {
                while !control.is_interrupted() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(Error::Terminated)
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_thread_cpu_time_advances() {
        let start = thread_cpu_time();
        let mut x = 0u64;
        for i in 0..2_000_000u64 {
            x = x.wrapping_add(i * i);
        }
        std::hint::black_box(x);
        assert!(thread_cpu_time() >= start);
    }
}
