//! V8 runner built on deno_core
//!
//! Each run creates a fresh `JsRuntime` with its own heap ceiling, installs a
//! small bootstrap (log capture, capability stand-ins, hardening), runs the
//! script and disposes the isolate before the thread exits.

use deno_core::{v8, JsRuntime, RuntimeOptions};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::prelude::{self, CapturedLog, PreludeOptions};
use super::{spawn_engine, ThreadControl};
use crate::error::{Error, Result};
use crate::sandbox::executor::{Capability, OutputBuffer, ResourceUsage, ScriptOutput};

/// How the script is embedded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsMode {
    /// Hardened global scope, script completion value is the result
    Isolated,
    /// Code is a function body, its return value is the result
    Worker,
}

/// One JavaScript job
#[derive(Debug, Clone)]
pub struct JsTask {
    pub code: String,
    pub mode: JsMode,
    pub heap_limit_bytes: u64,
    pub capabilities: BTreeSet<Capability>,
    pub max_output_bytes: usize,
}

impl JsTask {
    fn fault(&self) -> fn(String) -> Error {
        match self.mode {
            JsMode::Isolated => Error::Isolate,
            JsMode::Worker => Error::Worker,
        }
    }
}

/// Spawn the engine thread for `task`
pub fn spawn(
    id: Uuid,
    task: JsTask,
    control: ThreadControl,
) -> Result<tokio::sync::oneshot::Receiver<Result<ScriptOutput>>> {
    let fault = task.fault();
    spawn_engine(format!("sandbox-js-{}", id.simple()), control, fault, move |control| {
        run(task, control)
    })
}

/// State for the near-heap-limit callback
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution and grants 1MB so the termination can propagate
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the boxed HeapLimitState in `run`, which is
    // dropped only after the runtime that owns this callback.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

fn run(task: JsTask, control: &ThreadControl) -> Result<ScriptOutput> {
    let fault = task.fault();

    // deno_core expects a tokio context on the thread that owns the runtime
    let tokio_rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| fault(format!("failed to build engine runtime: {}", e)))?;
    let _context = tokio_rt.enter();

    let heap_limit = usize::try_from(task.heap_limit_bytes).unwrap_or(usize::MAX);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        create_params: Some(v8::CreateParams::default().heap_limits(0, heap_limit)),
        ..Default::default()
    });

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );
    control.attach_isolate(runtime.v8_isolate().thread_safe_handle());

    let outcome = execute(&mut runtime, &task);
    control.detach_isolate();

    let memory_bytes = used_heap_bytes(&mut runtime);
    drop(runtime);

    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(Error::MemoryLimit {
            limit_bytes: task.heap_limit_bytes,
        });
    }
    if control.is_interrupted() {
        return Err(Error::Terminated);
    }

    outcome.map(|output| ScriptOutput {
        output,
        resource_usage: ResourceUsage {
            memory_bytes,
            cpu_time_ns: 0,
        },
    })
}

fn execute(runtime: &mut JsRuntime, task: &JsTask) -> Result<String> {
    runtime
        .execute_script("[sandbox:bootstrap]", bootstrap_source(task))
        .map_err(|e| (task.fault())(format!("bootstrap failed: {}", e)))?;

    let source = match task.mode {
        JsMode::Isolated => task.code.clone(),
        JsMode::Worker => format!("(function () {{\n{}\n}})()", task.code),
    };

    let completion = match runtime.execute_script("[sandbox:main]", source) {
        Ok(value) => value,
        Err(e) => {
            let mut partial = OutputBuffer::new(task.max_output_bytes);
            drain_log(runtime).write_to(&mut partial);
            return Err(Error::Script {
                message: e.to_string(),
                output: partial.into_string(),
            });
        }
    };

    let completion = completion_text(runtime, completion);

    let mut output = OutputBuffer::new(task.max_output_bytes);
    drain_log(runtime).write_to(&mut output);
    if let Some(value) = completion {
        output.push_line(&value);
    }
    Ok(output.into_string())
}

/// Stringified completion value, `None` for `undefined`
fn completion_text(runtime: &mut JsRuntime, value: v8::Global<v8::Value>) -> Option<String> {
    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, value);
    if local.is_undefined() {
        return None;
    }
    Some(local.to_rust_string_lossy(scope))
}

fn drain_log(runtime: &mut JsRuntime) -> CapturedLog {
    let value = match runtime.execute_script("[sandbox:drain]", prelude::DRAIN_EXPR) {
        Ok(value) => value,
        Err(_) => return CapturedLog::default(),
    };
    let text = {
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        local.to_rust_string_lossy(scope)
    };
    CapturedLog::parse(&text)
}

fn used_heap_bytes(runtime: &mut JsRuntime) -> u64 {
    let mut stats = v8::HeapStatistics::default();
    runtime.v8_isolate().get_heap_statistics(&mut stats);
    stats.used_heap_size() as u64
}

fn bootstrap_source(task: &JsTask) -> String {
    let options = match task.mode {
        JsMode::Isolated => PreludeOptions {
            harden: true,
            console: false,
        },
        JsMode::Worker => PreludeOptions {
            harden: false,
            console: true,
        },
    };
    prelude::source(options, task.max_output_bytes, &task.capabilities)
}
