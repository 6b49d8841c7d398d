//! Capability stand-ins. Same shape as the browser APIs, no real I/O.

use std::collections::BTreeSet;

use crate::sandbox::executor::Capability;

const JS_CANVAS: &str = r#"
globalThis.createCanvas = (width = 800, height = 600) => ({
    width: Math.min(width, 1920),
    height: Math.min(height, 1080),
    getContext: () => ({
        fillRect() {},
        strokeRect() {},
        clearRect() {},
    }),
});
"#;

const JS_AUDIO: &str = r#"
globalThis.createAudio = () => ({
    createOscillator: () => ({
        frequency: { value: 440 },
        start() {},
        stop() {},
        connect() {},
    }),
    createGain: () => ({
        gain: { value: 1 },
        connect() {},
    }),
});
"#;

const LUA_CANVAS: &str = r#"
function createCanvas(width, height)
    local noop = function() end
    return {
        width = math.min(width or 800, 1920),
        height = math.min(height or 600, 1080),
        getContext = function()
            return { fillRect = noop, strokeRect = noop, clearRect = noop }
        end,
    }
end
"#;

const LUA_AUDIO: &str = r#"
function createAudio()
    local noop = function() end
    return {
        createOscillator = function()
            return { frequency = { value = 440 }, start = noop, stop = noop, connect = noop }
        end,
        createGain = function()
            return { gain = { value = 1 }, connect = noop }
        end,
    }
end
"#;

pub(super) fn js_source(capabilities: &BTreeSet<Capability>) -> String {
    capabilities
        .iter()
        .map(|c| match c {
            Capability::Canvas => JS_CANVAS,
            Capability::Audio => JS_AUDIO,
        })
        .collect()
}

pub(super) fn lua_source(capabilities: &BTreeSet<Capability>) -> String {
    capabilities
        .iter()
        .map(|c| match c {
            Capability::Canvas => LUA_CANVAS,
            Capability::Audio => LUA_AUDIO,
        })
        .collect()
}
