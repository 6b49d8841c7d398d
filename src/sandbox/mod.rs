//! Sandbox module - Tiered code execution
//!
//! Four isolation tiers behind one [`IsolationBackend`] trait:
//! - Maximum: Ephemeral Docker containers
//! - High: Fresh V8 isolate with its own heap ceiling
//! - Medium: Restricted embedded QuickJS and Lua interpreters
//! - Low: Worker thread in the host process
//!
//! Requests pass the static [`Validator`] and the [`ResourceGovernor`] before
//! the [`TierDispatcher`] hands them to a backend. Running executions live in
//! the [`ExecutionRegistry`], swept by the [`Reaper`].

mod container;
mod dispatcher;
pub(crate) mod engine;
mod executor;
mod governor;
mod interpreter;
mod isolate;
mod reaper;
mod registry;
mod result;
mod runtime;
mod service;
mod validator;
mod worker;

pub use container::ContainerBackend;
pub use dispatcher::TierDispatcher;
pub use engine::ThreadControl;
pub use executor::{
    Capability, ExecutionJob, ExecutionLimits, ExecutionMetadata, ExecutionRequest,
    ExecutionResult, ExecutionStatus, IsolationBackend, Language, LimitOverrides, OutputBuffer,
    ResourceUsage, ScriptOutput, SecurityLevel, TRUNCATION_MARKER,
};
pub use governor::{ResourceGovernor, JS_HEAP_FLOOR_BYTES};
pub use interpreter::InterpreterBackend;
pub use isolate::IsolateBackend;
pub use reaper::{Reaper, ReaperHandle, SweepSummary};
pub use registry::{
    BackendKind, BackendResource, ExecutionHandle, ExecutionRegistry, QueueGuard,
    RegistrationGuard,
};
pub use result::{assemble, ExecutionContext};
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerState, DockerRuntime, CODE_MOUNT};
pub use service::{ImageStatus, PendingExecution, SandboxService};
pub use validator::{Rule, Validator, DENYLIST_VERSION};
pub use worker::WorkerBackend;
