//! Script prelude shared by the JavaScript engines
//!
//! Installs log capture, optional `console`, optional hardening and the
//! requested capability stand-ins. Captured lines are drained as JSON.

use std::collections::BTreeSet;

use super::stubs;
use crate::sandbox::executor::{Capability, OutputBuffer};

/// Which globals the prelude leaves in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct PreludeOptions {
    /// Remove `eval`, `WebAssembly`, shared memory and the function constructors
    pub harden: bool,
    /// Expose a frozen `console` routed to the log
    pub console: bool,
}

/// Expression returning the captured log as JSON
pub(super) const DRAIN_EXPR: &str = "globalThis.__sandboxDrain()";

/// Global function turning a completion value into its display string
pub(super) const SHOW_FN: &str = "__sandboxShow";

/// Lines captured by `log`/`console.*`
#[derive(Debug, Default, serde::Deserialize)]
pub(super) struct CapturedLog {
    lines: Vec<String>,
    truncated: bool,
}

impl CapturedLog {
    pub(super) fn parse(json: &str) -> Self {
        serde_json::from_str(json).unwrap_or_default()
    }

    pub(super) fn write_to(self, buffer: &mut OutputBuffer) {
        for line in &self.lines {
            buffer.push_line(line);
        }
        if self.truncated {
            buffer.mark_truncated();
        }
    }
}

pub(super) fn source(
    options: PreludeOptions,
    max_output_bytes: usize,
    capabilities: &BTreeSet<Capability>,
) -> String {
    format!(
        r#"
        ((limit, harden, withConsole) => {{
            const stringify = JSON.stringify;
            const toText = String;
            const lines = [];
            let size = 0;
            let full = false;
            const fmt = (v) => {{
                if (typeof v === 'string') return v;
                try {{
                    const s = stringify(v);
                    return s === undefined ? toText(v) : s;
                }} catch (_) {{
                    return toText(v);
                }}
            }};
            const log = (...args) => {{
                if (full) return;
                const line = args.map(fmt).join(' ');
                size += line.length + 1;
                if (size > limit) {{
                    full = true;
                    return;
                }}
                lines.push(line);
            }};
            const lock = (name, value) => Object.defineProperty(globalThis, name, {{
                value, writable: false, enumerable: false, configurable: false,
            }});
            lock('__sandboxDrain', () => stringify({{ lines, truncated: full }}));
            lock('{show}', (v) => v === undefined ? undefined : toText(v));
            lock('log', log);

            delete globalThis.Deno;
            delete globalThis.__bootstrap;
            if (withConsole) {{
                globalThis.console = Object.freeze({{
                    log, info: log, warn: log, error: log, debug: log,
                }});
            }} else {{
                delete globalThis.console;
            }}
            if (harden) {{
                delete globalThis.eval;
                delete globalThis.WebAssembly;
                delete globalThis.SharedArrayBuffer;
                delete globalThis.Atomics;
                const ctors = [
                    Function,
                    (async function () {{}}).constructor,
                    (function* () {{}}).constructor,
                    (async function* () {{}}).constructor,
                ];
                for (const F of ctors) {{
                    Object.defineProperty(F.prototype, 'constructor', {{
                        value: undefined, configurable: false, writable: false,
                    }});
                }}
                delete globalThis.Function;
            }}
        }})({limit}, {harden}, {console});
        {stubs}
        "#,
        show = SHOW_FN,
        limit = max_output_bytes,
        harden = options.harden,
        console = options.console,
        stubs = stubs::js_source(capabilities),
    )
}
