//! Background cleanup of orphaned and hung executions

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReaperConfig;
use crate::sandbox::registry::{BackendKind, ExecutionRegistry};

/// Lower bound for the sweep period
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub inspected: usize,
    pub reaped_exited: usize,
    pub reaped_hung: usize,
    /// Reported executions whose engine is still winding down
    pub draining: usize,
    pub containers: usize,
    pub isolates: usize,
    pub interpreters: usize,
    pub workers: usize,
    pub queued: usize,
}

/// Periodic registry sweeper
pub struct Reaper {
    registry: Arc<ExecutionRegistry>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(registry: Arc<ExecutionRegistry>, config: ReaperConfig) -> Self {
        Reaper { registry, config }
    }

    /// Inspect every registered handle once
    pub async fn sweep(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();

        for handle in self.registry.snapshot() {
            summary.inspected += 1;
            let age = handle.age();

            if handle.draining {
                if handle.resource.has_exited().await {
                    self.registry.discard_drained(handle.kind, handle.id);
                } else {
                    handle.resource.force_stop().await;
                    summary.draining += 1;
                }
                continue;
            }

            if age >= self.config.max_execution_age {
                if self.registry.terminate(handle.id).await {
                    warn!(
                        execution_id = %handle.id,
                        backend = %handle.kind,
                        age_secs = age.as_secs(),
                        "Reaped hung execution"
                    );
                    summary.reaped_hung += 1;
                }
            } else if age >= self.config.orphan_grace
                && handle.resource.has_exited().await
                && self.registry.terminate(handle.id).await
            {
                warn!(
                    execution_id = %handle.id,
                    backend = %handle.kind,
                    "Reaped orphaned execution"
                );
                summary.reaped_exited += 1;
            }
        }

        summary.containers = self.registry.count(BackendKind::Container);
        summary.isolates = self.registry.count(BackendKind::Isolate);
        summary.interpreters = self.registry.count(BackendKind::Interpreter);
        summary.workers = self.registry.count(BackendKind::Worker);
        summary.queued = self.registry.queued_count();
        summary
    }

    /// Run the sweep loop until the handle is shut down
    pub fn start(self) -> ReaperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let period = self.config.interval.max(MIN_INTERVAL);
            let mut interval = tokio::time::interval(period);
            info!("Reaper started, interval: {:?}", period);

            // Skip the first immediate tick
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let summary = self.sweep().await;
                        debug!(
                            inspected = summary.inspected,
                            reaped_exited = summary.reaped_exited,
                            reaped_hung = summary.reaped_hung,
                            draining = summary.draining,
                            containers = summary.containers,
                            isolates = summary.isolates,
                            interpreters = summary.interpreters,
                            workers = summary.workers,
                            queued = summary.queued,
                            "Reaper sweep"
                        );
                    }
                }
            }

            info!("Reaper stopped");
        });

        ReaperHandle { cancel, task }
    }
}

/// Stops the reaper task
pub struct ReaperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Reaper task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::engine::ThreadControl;
    use crate::sandbox::registry::BackendResource;
    use uuid::Uuid;

    fn config(grace: Duration, max_age: Duration) -> ReaperConfig {
        ReaperConfig {
            enabled: true,
            interval: Duration::from_millis(20),
            orphan_grace: grace,
            max_execution_age: max_age,
        }
    }

    #[tokio::test]
    async fn test_reaps_exited_after_grace() {
        let registry = ExecutionRegistry::new();
        let exited = ThreadControl::new();
        // a thread that never reports exit
        let live = ThreadControl::new();

        // exited flag is only set by the engine thread
        let exited_rx = crate::sandbox::engine::spawn_engine(
            "reaper-test".to_string(),
            exited.clone(),
            crate::error::Error::Worker,
            |_| Ok(Default::default()),
        )
        .unwrap();
        exited_rx.await.unwrap().unwrap();
        while !exited.has_exited() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let _a = registry.register(Uuid::new_v4(), BackendKind::Worker, BackendResource::Thread(exited));
        let _b = registry.register(Uuid::new_v4(), BackendKind::Worker, BackendResource::Thread(live.clone()));

        let reaper = Reaper::new(registry.clone(), config(Duration::ZERO, Duration::from_secs(60)));
        let summary = reaper.sweep().await;
        assert_eq!(summary.inspected, 2);
        assert_eq!(summary.reaped_exited, 1);
        assert_eq!(summary.reaped_hung, 0);
        assert_eq!(summary.workers, 1);
        assert!(!live.is_interrupted());
    }

    #[tokio::test]
    async fn test_grace_period_protects_fresh_handles() {
        let registry = ExecutionRegistry::new();
        let control = ThreadControl::new();
        let _guard = registry.register(Uuid::new_v4(), BackendKind::Isolate, BackendResource::Thread(control));

        let reaper = Reaper::new(registry.clone(), config(Duration::from_secs(60), Duration::from_secs(120)));
        let summary = reaper.sweep().await;
        assert_eq!(summary.reaped_exited + summary.reaped_hung, 0);
        assert_eq!(summary.isolates, 1);
    }

    #[tokio::test]
    async fn test_reaps_hung_execution() {
        let registry = ExecutionRegistry::new();
        let control = ThreadControl::new();
        let guard = registry.register(Uuid::new_v4(), BackendKind::Interpreter, BackendResource::Thread(control.clone()));

        let reaper = Reaper::new(registry.clone(), config(Duration::ZERO, Duration::ZERO));
        let summary = reaper.sweep().await;
        assert_eq!(summary.reaped_hung, 1);
        assert!(control.is_interrupted());
        assert!(guard.cancel_token().is_cancelled());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_draining_handles_reinterrupted_then_discarded() {
        let registry = ExecutionRegistry::new();
        let control = ThreadControl::new();
        let id = Uuid::new_v4();
        let guard = registry.register(id, BackendKind::Interpreter, BackendResource::Thread(control.clone()));
        let (_, _drain) = guard.drain();

        let reaper = Reaper::new(registry.clone(), config(Duration::ZERO, Duration::ZERO));
        let summary = reaper.sweep().await;
        assert_eq!(summary.draining, 1);
        assert_eq!(summary.reaped_hung, 0);
        assert!(control.is_interrupted());
        assert!(registry.status(id).interpreter_active);

        let rx = crate::sandbox::engine::spawn_engine(
            "reaper-drain-test".to_string(),
            control.clone(),
            crate::error::Error::Interpreter,
            |_| Ok(Default::default()),
        )
        .unwrap();
        rx.await.unwrap().unwrap();
        control.exited().await;

        let summary = reaper.sweep().await;
        assert_eq!(summary.draining, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_background_loop_and_shutdown() {
        let registry = ExecutionRegistry::new();
        let control = ThreadControl::new();
        let _guard = registry.register(Uuid::new_v4(), BackendKind::Worker, BackendResource::Thread(control.clone()));

        let handle = Reaper::new(registry.clone(), config(Duration::ZERO, Duration::ZERO)).start();
        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());
        assert!(control.is_interrupted());

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
    }
}
