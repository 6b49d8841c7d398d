//! Lua runner built on mlua
//!
//! `Restricted` loads only the table/string/math/utf8 libraries and strips the
//! loaders; `Full` is the regular safe standard library. Both enforce the
//! allocator limit and poll the deadline from an instruction hook.
//!
//! The hook never runs inside a C call, so the backtracking pattern functions
//! are wrapped with a cost bound before any user code runs.

use mlua::{
    ChunkMode, Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table, Value,
    Variadic, VmState,
};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::{spawn_engine, stubs, ThreadControl};
use crate::error::{Error, Result};
use crate::sandbox::executor::{Capability, OutputBuffer, ResourceUsage, ScriptOutput};

/// Instructions between deadline checks
const HOOK_INTERVAL: u32 = 1000;

/// Upper bound on estimated matcher steps for one pattern call
const PATTERN_STEP_BUDGET: u64 = 200_000_000;

/// `string` functions that run the backtracking matcher
const PATTERN_FUNCTIONS: &[&str] = &["find", "match", "gmatch", "gsub"];

/// Globals removed in restricted mode
const RESTRICTED_REMOVED: &[&str] = &[
    "load",
    "loadstring",
    "loadfile",
    "dofile",
    "require",
    "collectgarbage",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaMode {
    Restricted,
    Full,
}

/// One Lua job
#[derive(Debug, Clone)]
pub struct LuaTask {
    pub code: String,
    pub mode: LuaMode,
    pub memory_limit_bytes: u64,
    pub timeout: Duration,
    pub capabilities: BTreeSet<Capability>,
    pub max_output_bytes: usize,
}

impl LuaTask {
    fn fault(&self) -> fn(String) -> Error {
        match self.mode {
            LuaMode::Restricted => Error::Interpreter,
            LuaMode::Full => Error::Worker,
        }
    }
}

/// Spawn the engine thread for `task`
pub fn spawn(
    id: Uuid,
    task: LuaTask,
    control: ThreadControl,
) -> Result<tokio::sync::oneshot::Receiver<Result<ScriptOutput>>> {
    let fault = task.fault();
    spawn_engine(format!("sandbox-lua-{}", id.simple()), control, fault, move |control| {
        run(task, control)
    })
}

fn run(task: LuaTask, control: &ThreadControl) -> Result<ScriptOutput> {
    let fault = task.fault();
    let deadline = Instant::now() + task.timeout;

    let lua = match task.mode {
        LuaMode::Restricted => Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )
        .map_err(|e| fault(format!("failed to create interpreter: {}", e)))?,
        LuaMode::Full => Lua::new(),
    };

    let sink = Rc::new(RefCell::new(OutputBuffer::new(task.max_output_bytes)));
    let tostring = install_globals(&lua, &task, sink.clone())
        .map_err(|e| fault(format!("failed to prepare globals: {}", e)))?;

    let limit = usize::try_from(task.memory_limit_bytes).unwrap_or(usize::MAX);
    lua.set_memory_limit(limit)
        .map_err(|e| fault(format!("failed to set memory limit: {}", e)))?;

    let timed_out = Arc::new(AtomicBool::new(false));
    let hook_timed_out = timed_out.clone();
    let hook_control = control.clone();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| {
            if hook_control.is_interrupted() {
                return Err(mlua::Error::RuntimeError("execution interrupted".to_string()));
            }
            if Instant::now() >= deadline {
                hook_timed_out.store(true, Ordering::SeqCst);
                return Err(mlua::Error::RuntimeError("execution timeout".to_string()));
            }
            Ok(VmState::Continue)
        },
    );

    let evaluated = lua
        .load(task.code.as_str())
        .set_name("=main")
        .set_mode(ChunkMode::Text)
        .eval::<mlua::MultiValue>()
        .and_then(|values| match values.into_iter().next() {
            None | Some(Value::Nil) => Ok(None),
            Some(value) => tostring.call::<String>(value).map(Some),
        });
    lua.remove_hook();

    let memory_bytes = lua.used_memory() as u64;
    let mut output = sink.replace(OutputBuffer::new(0));

    if timed_out.load(Ordering::SeqCst) {
        return Err(Error::Timeout {
            timeout_ms: task.timeout.as_millis() as u64,
        });
    }
    if control.is_interrupted() {
        return Err(Error::Terminated);
    }

    match evaluated {
        Ok(value) => {
            if let Some(value) = value {
                output.push_line(&value);
            }
            Ok(ScriptOutput {
                output: output.into_string(),
                resource_usage: ResourceUsage {
                    memory_bytes,
                    cpu_time_ns: 0,
                },
            })
        }
        Err(e) if is_memory_error(&e) => Err(Error::MemoryLimit {
            limit_bytes: task.memory_limit_bytes,
        }),
        Err(e) => Err(Error::Script {
            message: e.to_string(),
            output: output.into_string(),
        }),
    }
}

/// Install `print`, `console`, capability stand-ins and, in restricted mode,
/// strip the loaders. Returns the original `tostring`.
fn install_globals(
    lua: &Lua,
    task: &LuaTask,
    sink: Rc<RefCell<OutputBuffer>>,
) -> mlua::Result<Function> {
    let globals = lua.globals();
    let tostring: Function = globals.get("tostring")?;

    let print_sink = sink.clone();
    let print_tostring = tostring.clone();
    let print = lua.create_function(move |_, args: Variadic<Value>| {
        let line = render(&print_tostring, args, "\t")?;
        print_sink.borrow_mut().push_line(&line);
        Ok(())
    })?;
    globals.set("print", print)?;

    let log_tostring = tostring.clone();
    let log = lua.create_function(move |_, args: Variadic<Value>| {
        let line = render(&log_tostring, args, " ")?;
        sink.borrow_mut().push_line(&line);
        Ok(())
    })?;
    let console = lua.create_table()?;
    for level in ["log", "info", "warn", "error"] {
        console.set(level, log.clone())?;
    }
    globals.set("console", console)?;

    guard_patterns(lua)?;

    let stubs = stubs::lua_source(&task.capabilities);
    if !stubs.is_empty() {
        lua.load(stubs).set_name("=capabilities").exec()?;
    }

    if task.mode == LuaMode::Restricted {
        for name in RESTRICTED_REMOVED {
            globals.set(*name, Value::Nil)?;
        }
        let string: Table = globals.get("string")?;
        string.set("dump", Value::Nil)?;
    }

    Ok(tostring)
}

/// Wrap the matcher entry points so a call whose worst case exceeds
/// [`PATTERN_STEP_BUDGET`] fails instead of running.
fn guard_patterns(lua: &Lua) -> mlua::Result<()> {
    let string: Table = lua.globals().get("string")?;
    for name in PATTERN_FUNCTIONS {
        let original: Function = string.get(*name)?;
        let guarded = lua.create_function(move |_, args: MultiValue| {
            check_pattern_cost(name, &args)?;
            original.call::<MultiValue>(args)
        })?;
        string.set(*name, guarded)?;
    }
    Ok(())
}

fn check_pattern_cost(name: &str, args: &MultiValue) -> mlua::Result<()> {
    let subject_len = match args.front() {
        Some(Value::String(s)) => s.as_bytes().len(),
        _ => return Ok(()),
    };
    let pattern = match args.get(1) {
        Some(Value::String(p)) => p.as_bytes().to_vec(),
        _ => return Ok(()),
    };
    let plain = name == "find" && matches!(args.get(3), Some(v) if !matches!(v, Value::Nil | Value::Boolean(false)));
    if plain {
        return Ok(());
    }

    let steps = pattern_steps(subject_len, &pattern);
    if steps > PATTERN_STEP_BUDGET {
        return Err(mlua::Error::RuntimeError(format!(
            "string.{}: pattern too complex for a {}-byte subject",
            name, subject_len
        )));
    }
    Ok(())
}

/// Worst-case matcher steps: every start position, times the subject length
/// for each backtracking quantifier.
fn pattern_steps(subject_len: usize, pattern: &[u8]) -> u64 {
    let n = subject_len.max(1) as u64;
    let mut steps = n;
    for _ in 0..quantifier_count(pattern) {
        steps = steps.saturating_mul(n);
    }
    steps
}

/// Count `*`, `+`, `-` and `?` that apply to a pattern item
fn quantifier_count(pattern: &[u8]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i < pattern.len() {
        match pattern[i] {
            b'%' => {
                // %bxy and %f[set] take arguments, other escapes one byte
                match pattern.get(i + 1) {
                    Some(b'b') => i += 4,
                    Some(b'f') => i = skip_set(pattern, i + 2),
                    _ => i += 2,
                }
            }
            b'[' => i = skip_set(pattern, i),
            b'*' | b'+' | b'-' | b'?' if i > 0 => {
                count += 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    count
}

/// Index just past the set starting at `start` (which holds `[`)
fn skip_set(pattern: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    if pattern.get(i) == Some(&b'^') {
        i += 1;
    }
    // a leading ] is literal
    if pattern.get(i) == Some(&b']') {
        i += 1;
    }
    while i < pattern.len() {
        match pattern[i] {
            b'%' => i += 2,
            b']' => return i + 1,
            _ => i += 1,
        }
    }
    pattern.len()
}

fn render(tostring: &Function, args: Variadic<Value>, separator: &str) -> mlua::Result<String> {
    let parts = args
        .into_iter()
        .map(|v| tostring.call::<String>(v))
        .collect::<mlua::Result<Vec<_>>>()?;
    Ok(parts.join(separator))
}

fn is_memory_error(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } => is_memory_error(cause),
        mlua::Error::WithContext { cause, .. } => is_memory_error(cause),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(code: &str, mode: LuaMode) -> LuaTask {
        LuaTask {
            code: code.to_string(),
            mode,
            memory_limit_bytes: 32 * 1024 * 1024,
            timeout: Duration::from_secs(5),
            capabilities: BTreeSet::new(),
            max_output_bytes: 64 * 1024,
        }
    }

    fn run_blocking(task: LuaTask) -> Result<ScriptOutput> {
        let rx = spawn(Uuid::new_v4(), task, ThreadControl::new()).unwrap();
        rx.blocking_recv().unwrap()
    }

    #[test]
    fn test_return_value_and_print() {
        let out = run_blocking(task("print('a', 1)\nconsole.log('b', true)\nreturn 2 + 2", LuaMode::Restricted)).unwrap();
        assert_eq!(out.output, "a\t1\nb true\n4");
    }

    #[test]
    fn test_expression_chunk() {
        let out = run_blocking(task("6 * 7", LuaMode::Full)).unwrap();
        assert_eq!(out.output, "42");
    }

    #[test]
    fn test_restricted_globals_removed() {
        let out = run_blocking(task(
            "return table.concat({type(load), type(require), type(io), type(os), type(string.dump), type(dofile)}, ',')",
            LuaMode::Restricted,
        ))
        .unwrap();
        assert_eq!(out.output, "nil,nil,nil,nil,nil,nil");
    }

    #[test]
    fn test_full_mode_keeps_stdlib() {
        let out = run_blocking(task("return type(os.time)", LuaMode::Full)).unwrap();
        assert_eq!(out.output, "function");
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let mut t = task("while true do end", LuaMode::Restricted);
        t.timeout = Duration::from_millis(200);
        let started = Instant::now();
        let err = run_blocking(t).unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 200 }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_memory_limit() {
        let mut t = task(
            "local t = {}\nfor i = 1, 1e8 do t[i] = string.rep('x', 64) .. i end",
            LuaMode::Restricted,
        );
        t.memory_limit_bytes = 4 * 1024 * 1024;
        let err = run_blocking(t).unwrap_err();
        assert!(matches!(err, Error::MemoryLimit { .. }), "got {err:?}");
    }

    #[test]
    fn test_runtime_error_keeps_output() {
        let err = run_blocking(task("print('before')\nerror('boom')", LuaMode::Restricted)).unwrap_err();
        match err {
            Error::Script { message, output } => {
                assert!(message.contains("boom"));
                assert_eq!(output, "before");
            }
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_chunks_refused() {
        let err = run_blocking(task("\x1bLua", LuaMode::Restricted)).unwrap_err();
        assert!(matches!(err, Error::Script { .. }));
    }

    #[test]
    fn test_capability_stubs() {
        let mut t = task(
            "local c = createCanvas(100, 5000)\nlocal o = createAudio().createOscillator()\nreturn c.width .. 'x' .. c.height .. ' ' .. o.frequency.value",
            LuaMode::Restricted,
        );
        t.capabilities.insert(Capability::Canvas);
        t.capabilities.insert(Capability::Audio);
        let out = run_blocking(t).unwrap();
        assert_eq!(out.output, "100x1080 440");
    }

    #[test]
    fn test_quantifier_count() {
        assert_eq!(quantifier_count(b"hello"), 0);
        assert_eq!(quantifier_count(b".-.-.-b"), 3);
        assert_eq!(quantifier_count(b"%s+"), 1);
        assert_eq!(quantifier_count(b"%*%+"), 0);
        assert_eq!(quantifier_count(b"[*+-]x"), 0);
        assert_eq!(quantifier_count(b"[]]*"), 1);
        assert_eq!(quantifier_count(b"%b()%f[%w]%a*"), 1);
        assert_eq!(quantifier_count(b"-x"), 0);
    }

    #[test]
    fn test_backtracking_pattern_rejected_quickly() {
        for mode in [LuaMode::Restricted, LuaMode::Full] {
            let mut t = task("return string.find(string.rep('a', 300), '.-.-.-b')", mode);
            t.timeout = Duration::from_millis(200);
            let started = Instant::now();
            let err = run_blocking(t).unwrap_err();
            match err {
                Error::Script { message, .. } => assert!(message.contains("pattern too complex"), "{message}"),
                other => panic!("expected script error, got {other:?}"),
            }
            assert!(started.elapsed() < Duration::from_secs(1));
        }
    }

    #[test]
    fn test_method_syntax_is_guarded() {
        let err = run_blocking(task(
            "local s = string.rep('a', 2000)\nreturn s:match('(.-)(.-)b')",
            LuaMode::Restricted,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("pattern too complex"), "{err}");
    }

    #[test]
    fn test_ordinary_patterns_still_work() {
        let out = run_blocking(task(
            "local s = string.rep('x', 50000) .. 'y'\n\
             local plain = s:find('y', 1, true)\n\
             local squeezed = ('a  b   c'):gsub('%s+', '')\n\
             local word = ('key=value'):match('^(%w+)=')\n\
             return plain .. ' ' .. squeezed .. ' ' .. word",
            LuaMode::Restricted,
        ))
        .unwrap();
        assert_eq!(out.output, "50001 abc key");
    }

    #[test]
    fn test_interrupt() {
        let control = ThreadControl::new();
        let rx = spawn(Uuid::new_v4(), task("while true do end", LuaMode::Full), control.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        control.interrupt();
        let err = rx.blocking_recv().unwrap().unwrap_err();
        assert!(matches!(err, Error::Terminated));
    }
}
