//! Execution registry
//!
//! Single source of truth for which executions are running. One map per
//! backend kind plus the admission queue. Whoever removes an entry owns the
//! terminal outcome: a backend that finds its entry already gone reports
//! `Terminated`, and `terminate` on a missing id returns `false`.
//!
//! An engine thread that outlives its reported result stays in the registry
//! as draining. Draining entries count as active but cannot be terminated
//! again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sandbox::engine::ThreadControl;
use crate::sandbox::executor::ExecutionStatus;
use crate::sandbox::runtime::ContainerRuntime;

/// Which backend owns a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Container,
    Isolate,
    Interpreter,
    Worker,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Container,
        BackendKind::Isolate,
        BackendKind::Interpreter,
        BackendKind::Worker,
    ];
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Container => write!(f, "container"),
            BackendKind::Isolate => write!(f, "isolate"),
            BackendKind::Interpreter => write!(f, "interpreter"),
            BackendKind::Worker => write!(f, "worker"),
        }
    }
}

/// Backend-specific resource behind a handle
#[derive(Clone)]
pub enum BackendResource {
    Container {
        name: String,
        runtime: Arc<dyn ContainerRuntime>,
    },
    Thread(ThreadControl),
}

impl std::fmt::Debug for BackendResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendResource::Container { name, .. } => {
                f.debug_struct("Container").field("name", name).finish()
            }
            BackendResource::Thread(control) => f.debug_tuple("Thread").field(control).finish(),
        }
    }
}

impl BackendResource {
    /// Stop the underlying resource. Errors are logged, not returned.
    pub async fn force_stop(&self) {
        match self {
            BackendResource::Container { name, runtime } => {
                if let Err(e) = runtime.kill(name).await {
                    debug!(container = %name, "Kill failed: {}", e);
                }
                if let Err(e) = runtime.remove(name).await {
                    warn!(container = %name, "Failed to remove container: {}", e);
                }
            }
            BackendResource::Thread(control) => control.interrupt(),
        }
    }

    /// Whether the container or thread has already finished
    pub async fn has_exited(&self) -> bool {
        match self {
            BackendResource::Container { name, runtime } => match runtime.inspect(name).await {
                Ok(state) => !state.running,
                Err(_) => true,
            },
            BackendResource::Thread(control) => control.has_exited(),
        }
    }
}

/// Registry record for one running execution
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub id: Uuid,
    pub kind: BackendKind,
    pub resource: BackendResource,
    pub started_at: Instant,
    pub cancel: CancellationToken,
    /// Result already reported, resource still winding down
    pub draining: bool,
    released: CancellationToken,
}

impl ExecutionHandle {
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

type HandleMap = Mutex<HashMap<Uuid, ExecutionHandle>>;

/// Execution registry
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    containers: HandleMap,
    isolates: HandleMap,
    interpreters: HandleMap,
    workers: HandleMap,
    queued: Mutex<HashMap<Uuid, CancellationToken>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecutionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn map(&self, kind: BackendKind) -> &HandleMap {
        match kind {
            BackendKind::Container => &self.containers,
            BackendKind::Isolate => &self.isolates,
            BackendKind::Interpreter => &self.interpreters,
            BackendKind::Worker => &self.workers,
        }
    }

    /// Register a running execution. The guard deregisters on drop.
    pub fn register(
        self: &Arc<Self>,
        id: Uuid,
        kind: BackendKind,
        resource: BackendResource,
    ) -> RegistrationGuard {
        let cancel = CancellationToken::new();
        let started_at = Instant::now();
        let handle = ExecutionHandle {
            id,
            kind,
            resource: resource.clone(),
            started_at,
            cancel: cancel.clone(),
            draining: false,
            released: CancellationToken::new(),
        };
        lock(self.map(kind)).insert(id, handle);
        debug!(execution_id = %id, backend = %kind, "Registered execution");

        RegistrationGuard {
            registry: Arc::clone(self),
            id,
            kind,
            resource,
            started_at,
            cancel,
            finished: false,
        }
    }

    /// Record a request waiting for an admission slot
    pub fn enqueue(self: &Arc<Self>, id: Uuid) -> QueueGuard {
        let cancel = CancellationToken::new();
        lock(&self.queued).insert(id, cancel.clone());
        QueueGuard {
            registry: Arc::clone(self),
            id,
            cancel,
            done: false,
        }
    }

    fn take(&self, kind: BackendKind, id: &Uuid) -> Option<ExecutionHandle> {
        let handle = lock(self.map(kind)).remove(id);
        if let Some(ref handle) = handle {
            handle.released.cancel();
        }
        handle
    }

    /// Fires once `id` leaves the registry. `None` when it is not registered.
    pub fn released(&self, id: Uuid) -> Option<CancellationToken> {
        BackendKind::ALL
            .into_iter()
            .find_map(|kind| lock(self.map(kind)).get(&id).map(|h| h.released.clone()))
    }

    /// Drop a draining entry whose resource is gone
    pub fn discard_drained(&self, kind: BackendKind, id: Uuid) -> bool {
        let draining = lock(self.map(kind)).get(&id).is_some_and(|h| h.draining);
        draining && self.take(kind, &id).is_some()
    }

    /// Stop an execution by id. Idempotent: `false` when nothing was registered.
    pub async fn terminate(&self, id: Uuid) -> bool {
        if let Some(cancel) = lock(&self.queued).remove(&id) {
            cancel.cancel();
            info!(execution_id = %id, "Terminated queued execution");
            return true;
        }

        for kind in BackendKind::ALL {
            let found = {
                let mut map = lock(self.map(kind));
                match map.get(&id).map(|h| h.draining) {
                    Some(true) => {
                        debug!(execution_id = %id, backend = %kind, "Execution already reported, still draining");
                        return false;
                    }
                    Some(false) => map.remove(&id),
                    None => None,
                }
            };
            if let Some(handle) = found {
                handle.released.cancel();
                handle.cancel.cancel();
                handle.resource.force_stop().await;
                info!(execution_id = %id, backend = %kind, "Terminated execution");
                return true;
            }
        }

        false
    }

    /// Terminate everything, used on shutdown
    pub async fn terminate_all(&self) -> usize {
        let mut ids: Vec<Uuid> = lock(&self.queued).keys().copied().collect();
        for kind in BackendKind::ALL {
            ids.extend(lock(self.map(kind)).keys().copied());
        }

        let mut stopped = 0;
        for id in ids {
            if self.terminate(id).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Presence of `id` in each map. Unknown ids report all false.
    pub fn status(&self, id: Uuid) -> ExecutionStatus {
        ExecutionStatus {
            container_active: lock(&self.containers).contains_key(&id),
            worker_active: lock(&self.workers).contains_key(&id),
            queued_execution: lock(&self.queued).contains_key(&id),
            isolate_active: lock(&self.isolates).contains_key(&id),
            interpreter_active: lock(&self.interpreters).contains_key(&id),
        }
    }

    /// Copies of every running handle
    pub fn snapshot(&self) -> Vec<ExecutionHandle> {
        BackendKind::ALL
            .into_iter()
            .flat_map(|kind| lock(self.map(kind)).values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn count(&self, kind: BackendKind) -> usize {
        lock(self.map(kind)).len()
    }

    pub fn queued_count(&self) -> usize {
        lock(&self.queued).len()
    }

    /// Running plus queued
    pub fn len(&self) -> usize {
        BackendKind::ALL.iter().map(|k| self.count(*k)).sum::<usize>() + self.queued_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owned by the backend for the lifetime of one execution
#[derive(Debug)]
pub struct RegistrationGuard {
    registry: Arc<ExecutionRegistry>,
    id: Uuid,
    kind: BackendKind,
    resource: BackendResource,
    started_at: Instant,
    cancel: CancellationToken,
    finished: bool,
}

impl RegistrationGuard {
    /// Fires when the execution is terminated from outside
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Deregister. `false` means someone else removed the entry first.
    pub fn finish(mut self) -> bool {
        self.finished = true;
        let removed = self.registry.take(self.kind, &self.id).is_some();
        debug!(execution_id = %self.id, backend = %self.kind, removed, "Deregistered execution");
        removed
    }

    /// Keep the entry registered as draining after the result is reported.
    /// The flag is `false` when someone else had already removed the entry;
    /// the entry is put back as draining either way.
    pub fn drain(mut self) -> (bool, DrainGuard) {
        self.finished = true;
        let owned = {
            let mut map = lock(self.registry.map(self.kind));
            match map.get_mut(&self.id) {
                Some(handle) => {
                    handle.draining = true;
                    true
                }
                None => {
                    map.insert(
                        self.id,
                        ExecutionHandle {
                            id: self.id,
                            kind: self.kind,
                            resource: self.resource.clone(),
                            started_at: self.started_at,
                            cancel: self.cancel.clone(),
                            draining: true,
                            released: CancellationToken::new(),
                        },
                    );
                    false
                }
            }
        };
        debug!(execution_id = %self.id, backend = %self.kind, owned, "Execution draining");

        let drain = DrainGuard {
            registry: Arc::clone(&self.registry),
            id: self.id,
            kind: self.kind,
        };
        (owned, drain)
    }
}

/// Removes a draining entry when dropped
#[derive(Debug)]
pub struct DrainGuard {
    registry: Arc<ExecutionRegistry>,
    id: Uuid,
    kind: BackendKind,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.registry.take(self.kind, &self.id);
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.take(self.kind, &self.id);
        }
    }
}

/// Owned by a submitted request until it gets a slot
#[derive(Debug)]
pub struct QueueGuard {
    registry: Arc<ExecutionRegistry>,
    id: Uuid,
    cancel: CancellationToken,
    done: bool,
}

impl QueueGuard {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Leave the queue. `false` means the request was terminated while waiting.
    pub fn dequeue(mut self) -> bool {
        self.done = true;
        lock(&self.registry.queued).remove(&self.id).is_some()
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        if !self.done {
            lock(&self.registry.queued).remove(&self.id);
        }
    }
}
