//! Static validation of submitted code
//!
//! Runs before any backend resource is allocated. Rejects empty or oversized
//! code and anything matching the denylist. Matches are reported on the
//! `security` tracing target with a short escaped excerpt, never the full code.

use regex::Regex;
use tracing::warn;

use crate::error::{Result, RuleCategory, ValidationError};
use crate::sandbox::executor::{ExecutionRequest, Language};

/// Bumped whenever a rule is added, removed or changed
pub const DENYLIST_VERSION: u32 = 3;

/// Longest excerpt written to the security log
const SNIPPET_CHARS: usize = 200;
/// Characters of context kept before the match
const SNIPPET_LEAD: usize = 40;

struct RuleDef {
    name: &'static str,
    category: RuleCategory,
    /// `None` applies to every language
    language: Option<Language>,
    pattern: &'static str,
}

const fn rule(
    name: &'static str,
    category: RuleCategory,
    language: Option<Language>,
    pattern: &'static str,
) -> RuleDef {
    RuleDef {
        name,
        category,
        language,
        pattern,
    }
}

use Language::{CSharp, JavaScript, Lua, Python};
use RuleCategory::{DynamicEval, Filesystem, Introspection, Network, Process};

const RULES: &[RuleDef] = &[
    // Language-agnostic
    rule("require-fs", Filesystem, None, r#"require\s*\(\s*['"`](node:)?fs(/promises)?['"`]\s*\)"#),
    rule("require-child-process", Process, None, r#"require\s*\(\s*['"`](node:)?(child_process|cluster|worker_threads)['"`]\s*\)"#),
    rule("require-net", Network, None, r#"require\s*\(\s*['"`](node:)?(net|http|https|http2|dgram|tls|dns)['"`]\s*\)"#),
    rule("eval-call", DynamicEval, None, r"\beval\s*\("),
    rule("function-constructor", DynamicEval, None, r"\bFunction\s*\("),
    rule("static-import", DynamicEval, None, r#"\bimport\s+[\w{}*,\s]+\s+from\s+['"`]"#),
    rule("process-access", Introspection, None, r"\bprocess\s*\."),
    rule("global-access", Introspection, None, r"\bglobal\s*\."),
    rule("module-path-globals", Introspection, None, r"\b__(dirname|filename)\b"),
    // JavaScript
    rule("js-fs-api", Filesystem, Some(JavaScript), r"\b(readFileSync|writeFileSync|appendFileSync|createReadStream|createWriteStream|readdirSync|unlinkSync)\b"),
    rule("js-spawn", Process, Some(JavaScript), r"\b(execSync|execFile|execFileSync|spawnSync)\b|\bspawn\s*\(|\bnew\s+Worker\s*\("),
    rule("js-network", Network, Some(JavaScript), r"\b(fetch|XMLHttpRequest|WebSocket|EventSource)\b|\bnavigator\s*\.\s*sendBeacon"),
    rule("js-dynamic-import", DynamicEval, Some(JavaScript), r"\bimport\s*\("),
    rule("js-dynamic-require", DynamicEval, Some(JavaScript), r#"\brequire\s*\(\s*[^'"`\s)]"#),
    rule("js-constructor-chain", DynamicEval, Some(JavaScript), r"\.\s*constructor\s*(\.\s*constructor|\[\s*['`]constructor)|\[\s*['`]constructor['`]\s*\]\s*\("),
    rule("js-wasm", DynamicEval, Some(JavaScript), r"\bWebAssembly\b"),
    rule("js-string-timer", DynamicEval, Some(JavaScript), r#"\bset(Timeout|Interval)\s*\(\s*['"`]"#),
    rule("js-runtime-globals", Introspection, Some(JavaScript), r"\b(Deno|Bun)\s*\.|\bmodule\s*\.\s*(constructor|require)\b|\brequire\s*\.\s*(main|cache|resolve)\b"),
    // Python
    rule("py-open", Filesystem, Some(Python), r"\bopen\s*\(|\b(import|from)\s+(shutil|pathlib|tempfile|glob|io)\b"),
    rule("py-process-modules", Process, Some(Python), r"\b(import|from)\s+(os|subprocess|pty|multiprocessing|signal|threading)\b"),
    rule("py-network-modules", Network, Some(Python), r"\b(import|from)\s+(socket|urllib|urllib3|http|requests|ftplib|smtplib|ssl|asyncio)\b"),
    rule("py-dynamic-import", DynamicEval, Some(Python), r"\b__import__\b|\b(import|from)\s+(importlib|ctypes|marshal|pickle|code)\b"),
    rule("py-exec", DynamicEval, Some(Python), r"\b(exec|compile)\s*\("),
    rule("py-introspection", Introspection, Some(Python), r"\b(import|from)\s+(sys|inspect|gc)\b|__(builtins|subclasses|globals|code|bases|mro)__|\b(globals|locals|vars)\s*\(\s*\)|\bgetattr\s*\("),
    // Lua
    rule("lua-io", Filesystem, Some(Lua), r"\bio\s*[.:]|\bos\s*\.\s*(remove|rename|tmpname)\b"),
    rule("lua-os-process", Process, Some(Lua), r"\bos\s*\.\s*(execute|exit)\b|\bpopen\b"),
    rule("lua-network", Network, Some(Lua), r#"\b(socket|ssl)\s*\.|\blua-?socket\b|['"]socket(\.\w+)?['"]"#),
    rule("lua-load", DynamicEval, Some(Lua), r"\b(load|loadstring|loadfile|dofile|require)\b|\bstring\s*\.\s*dump\b"),
    rule("lua-introspection", Introspection, Some(Lua), r"\b(debug|package)\s*\.|\b(getfenv|setfenv|collectgarbage)\b|\b_ENV\b|\b_G\b|\bos\s*\.\s*getenv\b"),
    // C#
    rule("cs-io", Filesystem, Some(CSharp), r"\bSystem\s*\.\s*IO\b|\b(File|Directory)\s*\.\s*\w+\s*\("),
    rule("cs-process", Process, Some(CSharp), r"\bSystem\s*\.\s*Diagnostics\b|\bProcess\s*\.\s*Start\b"),
    rule("cs-network", Network, Some(CSharp), r"\bSystem\s*\.\s*Net\b|\b(HttpClient|WebClient|TcpClient|Socket)\b"),
    rule("cs-reflection", DynamicEval, Some(CSharp), r"\bSystem\s*\.\s*Reflection\b|\bAssembly\s*\.\s*Load|\bActivator\s*\.|\bCSharpScript\b|\bDllImport\b|\bunsafe\b|(?m)^\s*#\s*(r|load)\b"),
    rule("cs-environment", Introspection, Some(CSharp), r"\bEnvironment\s*\.|\bAppDomain\b|\bMarshal\s*\.|\bGC\s*\."),
];

/// One compiled denylist rule
#[derive(Debug)]
pub struct Rule {
    pub name: &'static str,
    pub category: RuleCategory,
    pub language: Option<Language>,
    regex: Regex,
}

impl Rule {
    fn applies_to(&self, language: Language) -> bool {
        self.language.map_or(true, |l| l == language)
    }
}

/// Static validator
#[derive(Debug)]
pub struct Validator {
    rules: Vec<Rule>,
    max_code_chars: usize,
}

impl Validator {
    /// Compile the denylist
    pub fn new(max_code_chars: usize) -> Result<Self> {
        let rules = RULES
            .iter()
            .map(|def| {
                Regex::new(def.pattern)
                    .map(|regex| Rule {
                        name: def.name,
                        category: def.category,
                        language: def.language,
                        regex,
                    })
                    .map_err(|e| {
                        crate::Error::Internal(format!("invalid denylist rule {}: {}", def.name, e))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Validator {
            rules,
            max_code_chars,
        })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Check a request. Pure apart from logging.
    pub fn validate(&self, request: &ExecutionRequest) -> std::result::Result<(), ValidationError> {
        let code = request.code.as_str();

        if code.trim().is_empty() {
            return Err(ValidationError::new("empty-code", "Code must not be empty"));
        }

        let chars = code.chars().count();
        if chars > self.max_code_chars {
            return Err(ValidationError::new(
                "code-size",
                format!(
                    "Code length {} exceeds the limit of {} characters",
                    chars, self.max_code_chars
                ),
            ));
        }

        // Agnostic rules come first in the table, so this also fixes check order.
        for rule in self.rules.iter().filter(|r| r.applies_to(request.language)) {
            if let Some(m) = rule.regex.find(code) {
                warn!(
                    target: "security",
                    rule = rule.name,
                    category = %rule.category,
                    language = %request.language,
                    denylist_version = DENYLIST_VERSION,
                    snippet = %snippet(code, m.start()),
                    "Dangerous code pattern detected"
                );
                return Err(ValidationError::new(
                    rule.name,
                    format!("Code contains a forbidden {} pattern", rule.category),
                )
                .with_category(rule.category));
            }
        }

        Ok(())
    }
}

/// Escaped excerpt of at most `SNIPPET_CHARS` characters around `byte_offset`
fn snippet(code: &str, byte_offset: usize) -> String {
    let match_char = code[..byte_offset].chars().count();
    let start = match_char.saturating_sub(SNIPPET_LEAD);
    code.chars()
        .skip(start)
        .take(SNIPPET_CHARS)
        .collect::<String>()
        .escape_debug()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(100_000).unwrap()
    }

    fn check(code: &str, language: Language) -> std::result::Result<(), ValidationError> {
        validator().validate(&ExecutionRequest::new(code, language))
    }

    #[test]
    fn test_rules_compile() {
        assert_eq!(validator().rules().len(), RULES.len());
    }

    #[test]
    fn test_every_language_covers_every_category() {
        let v = validator();
        for language in Language::ALL {
            for category in RuleCategory::ALL {
                assert!(
                    v.rules()
                        .iter()
                        .any(|r| r.language == Some(language) && r.category == category),
                    "{} has no {} rule",
                    language,
                    category
                );
            }
        }
    }

    #[test]
    fn test_require_fs_rejected() {
        let err = check("require('fs').readFileSync('/etc/passwd')", Language::JavaScript)
            .unwrap_err();
        assert_eq!(err.rule, "require-fs");
        assert_eq!(err.category, Some(RuleCategory::Filesystem));

        // agnostic rules hold for every language
        assert!(check("require(\"child_process\")", Language::Lua).is_err());
    }

    #[test]
    fn test_code_size_cap_counts_chars() {
        let v = Validator::new(4).unwrap();
        let ok = ExecutionRequest::new("éééé", Language::JavaScript);
        assert!(v.validate(&ok).is_ok());

        let too_long = ExecutionRequest::new("x = 1", Language::JavaScript);
        assert_eq!(v.validate(&too_long).unwrap_err().rule, "code-size");
    }

    #[test]
    fn test_empty_code_rejected() {
        assert_eq!(check("   \n", Language::Lua).unwrap_err().rule, "empty-code");
    }

    #[test]
    fn test_language_specific_rules() {
        assert_eq!(check("import os\nos.system('ls')", Language::Python).unwrap_err().rule, "py-process-modules");
        assert_eq!(check("x = __import__('os')", Language::Python).unwrap_err().rule, "py-dynamic-import");
        assert_eq!(check("os.execute('ls')", Language::Lua).unwrap_err().rule, "lua-os-process");
        assert_eq!(check("local f = load('return 1')", Language::Lua).unwrap_err().rule, "lua-load");
        assert_eq!(check("fetch('https://example.com')", Language::JavaScript).unwrap_err().rule, "js-network");
        assert_eq!(check("Process.Start(\"sh\");", Language::CSharp).unwrap_err().rule, "cs-process");
        assert_eq!(check("#r \"nuget: Foo\"", Language::CSharp).unwrap_err().rule, "cs-reflection");
    }

    #[test]
    fn test_benign_code_passes() {
        assert!(check("return 2+2", Language::JavaScript).is_ok());
        assert!(check("const c = createCanvas(800, 600); log(c.width);", Language::JavaScript).is_ok());
        assert!(check("globalThis.score = 10; score * 2", Language::JavaScript).is_ok());
        assert!(check("print(sum([1, 2, 3]))", Language::Python).is_ok());
        assert!(check("local t = {}\nfor i = 1, 3 do t[i] = i * i end\nprint(#t)", Language::Lua).is_ok());
        assert!(check("Console.WriteLine(1 + 1);", Language::CSharp).is_ok());
    }

    #[test]
    fn test_rules_do_not_leak_across_languages() {
        // Python's open() is not a JavaScript concern
        assert!(check("const door = open(1)", Language::JavaScript).is_ok());
        assert!(check("local f = fetch", Language::Lua).is_ok());
    }

    #[test]
    fn test_snippet_is_bounded_and_escaped() {
        let code = format!("{}\u{1b}eval(1){}", "a".repeat(100), "b".repeat(500));
        let offset = code.find("eval").unwrap();
        let s = snippet(&code, offset);
        assert!(s.contains("\\u{1b}eval(1)"));
        assert!(!s.contains('\u{1b}'));
        assert!(s.chars().count() <= SNIPPET_CHARS + 8);
        assert!(s.starts_with("aaa"));
    }
}
