//! QuickJS runner built on rquickjs
//!
//! Medium-tier JavaScript. The runtime lives on the host heap and is bounded
//! by QuickJS allocator accounting. `eval`, the function constructors and
//! shared memory are removed, `console` and `log` write to the captured log,
//! and the interrupt handler enforces the deadline.

use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Runtime, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::prelude::{self, CapturedLog, PreludeOptions};
use super::{spawn_engine, ThreadControl};
use crate::error::{Error, Result};
use crate::sandbox::executor::{Capability, OutputBuffer, ResourceUsage, ScriptOutput};

/// Native stack available to scripts
const MAX_STACK_BYTES: usize = 512 * 1024;

/// One QuickJS job
#[derive(Debug, Clone)]
pub struct QuickJsTask {
    pub code: String,
    pub memory_limit_bytes: u64,
    pub timeout: Duration,
    pub capabilities: BTreeSet<Capability>,
    pub max_output_bytes: usize,
}

/// Spawn the engine thread for `task`
pub fn spawn(
    id: Uuid,
    task: QuickJsTask,
    control: ThreadControl,
) -> Result<tokio::sync::oneshot::Receiver<Result<ScriptOutput>>> {
    spawn_engine(
        format!("sandbox-qjs-{}", id.simple()),
        control,
        Error::Interpreter,
        move |control| run(task, control),
    )
}

fn run(task: QuickJsTask, control: &ThreadControl) -> Result<ScriptOutput> {
    let deadline = Instant::now() + task.timeout;

    let runtime = Runtime::new()
        .map_err(|e| Error::Interpreter(format!("failed to create runtime: {}", e)))?;
    runtime.set_memory_limit(usize::try_from(task.memory_limit_bytes).unwrap_or(usize::MAX));
    runtime.set_max_stack_size(MAX_STACK_BYTES);

    let timed_out = Arc::new(AtomicBool::new(false));
    let handler_timed_out = timed_out.clone();
    let handler_control = control.clone();
    runtime.set_interrupt_handler(Some(Box::new(move || {
        if handler_control.is_interrupted() {
            return true;
        }
        if Instant::now() >= deadline {
            handler_timed_out.store(true, Ordering::SeqCst);
            return true;
        }
        false
    })));

    let context = Context::full(&runtime)
        .map_err(|e| Error::Interpreter(format!("failed to create context: {}", e)))?;
    let outcome = context.with(|ctx| execute(&ctx, &task));
    let memory_bytes = runtime.memory_usage().memory_used_size.max(0) as u64;

    if timed_out.load(Ordering::SeqCst) {
        return Err(Error::Timeout {
            timeout_ms: task.timeout.as_millis() as u64,
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

fn execute(ctx: &Ctx<'_>, task: &QuickJsTask) -> Result<String> {
    let options = PreludeOptions {
        harden: true,
        console: true,
    };
    ctx.eval::<(), _>(prelude::source(options, task.max_output_bytes, &task.capabilities))
        .catch(ctx)
        .map_err(|e| Error::Interpreter(format!("bootstrap failed: {}", e)))?;

    let completion = match ctx.eval::<Value, _>(task.code.as_str()).catch(ctx) {
        Ok(value) => value,
        Err(caught) => return Err(script_failure(ctx, task, caught)),
    };

    let show: Function = ctx
        .globals()
        .get(prelude::SHOW_FN)
        .map_err(|e| Error::Interpreter(format!("prelude missing: {}", e)))?;
    let shown = match show.call::<_, Option<String>>((completion,)).catch(ctx) {
        Ok(shown) => shown,
        Err(caught) => return Err(script_failure(ctx, task, caught)),
    };

    let mut output = OutputBuffer::new(task.max_output_bytes);
    drain_log(ctx).write_to(&mut output);
    if let Some(value) = shown {
        output.push_line(&value);
    }
    Ok(output.into_string())
}

fn script_failure(ctx: &Ctx<'_>, task: &QuickJsTask, caught: CaughtError<'_>) -> Error {
    let message = caught.to_string();
    if matches!(caught, CaughtError::Error(rquickjs::Error::Allocation))
        || message.contains("out of memory")
    {
        return Error::MemoryLimit {
            limit_bytes: task.memory_limit_bytes,
        };
    }

    let mut partial = OutputBuffer::new(task.max_output_bytes);
    drain_log(ctx).write_to(&mut partial);
    Error::Script {
        message,
        output: partial.into_string(),
    }
}

fn drain_log(ctx: &Ctx<'_>) -> CapturedLog {
    match ctx.eval::<String, _>(prelude::DRAIN_EXPR) {
        Ok(json) => CapturedLog::parse(&json),
        Err(_) => CapturedLog::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(code: &str) -> QuickJsTask {
        QuickJsTask {
            code: code.to_string(),
            memory_limit_bytes: 32 * 1024 * 1024,
            timeout: Duration::from_secs(5),
            capabilities: BTreeSet::new(),
            max_output_bytes: 64 * 1024,
        }
    }

    fn run_blocking(task: QuickJsTask) -> Result<ScriptOutput> {
        let rx = spawn(Uuid::new_v4(), task, ThreadControl::new()).unwrap();
        rx.blocking_recv().unwrap()
    }

    #[test]
    fn test_console_and_completion_value() {
        let out = run_blocking(task("console.log('sum', 1 + 2, {a: [1]}); 6 * 7")).unwrap();
        assert_eq!(out.output, "sum 3 {\"a\":[1]}\n42");
        assert!(out.resource_usage.memory_bytes > 0);
    }

    #[test]
    fn test_undefined_completion_omitted() {
        let out = run_blocking(task("log('only'); undefined")).unwrap();
        assert_eq!(out.output, "only");
    }

    #[test]
    fn test_eval_and_constructors_removed() {
        let out = run_blocking(task(
            "[typeof eval, typeof WebAssembly, typeof Function, typeof SharedArrayBuffer, String((() => 1).constructor)].join(',')",
        ))
        .unwrap();
        assert_eq!(out.output, "undefined,undefined,undefined,undefined,undefined");
    }

    #[test]
    fn test_exception_keeps_partial_output() {
        let err = run_blocking(task("console.log('before'); throw new Error('boom')")).unwrap_err();
        match err {
            Error::Script { message, output } => {
                assert!(message.contains("boom"), "{message}");
                assert_eq!(output, "before");
            }
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[test]
    fn test_capability_stubs() {
        let mut t = task("const c = createCanvas(); [c.width, c.height, typeof createAudio].join('x')");
        t.capabilities.insert(Capability::Canvas);
        let out = run_blocking(t).unwrap();
        assert_eq!(out.output, "800x600xundefined");
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let mut t = task("while (true) {}");
        t.timeout = Duration::from_millis(200);
        let started = Instant::now();
        let err = run_blocking(t).unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 200 }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_memory_limit() {
        let mut t = task("const parts = []; for (;;) { parts.push('z'.repeat(65536) + parts.length); }");
        t.memory_limit_bytes = 4 * 1024 * 1024;
        let err = run_blocking(t).unwrap_err();
        assert!(matches!(err, Error::MemoryLimit { .. }), "got {err:?}");
    }

    #[test]
    fn test_interrupt() {
        let control = ThreadControl::new();
        let rx = spawn(Uuid::new_v4(), task("for (;;) {}"), control.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        control.interrupt();
        let err = rx.blocking_recv().unwrap().unwrap_err();
        assert!(matches!(err, Error::Terminated));
    }
}
