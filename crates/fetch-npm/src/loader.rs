//! Module loading.
//!
//! Turning fetched text into something usable is a capability injected into
//! the fetchers through [`ModuleLoader`]. Nothing in this crate executes the
//! fetched code. [`ExportScanner`] reads the export surface of CommonJS and
//! ES module text statically; [`RawSourceLoader`] hands the text back as-is.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{FetchError, Result};

/// How the source text is expected to be shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleFormat {
    CommonJs,
    Esm,
}

impl ModuleFormat {
    /// Entry file requested when the caller names none.
    pub fn default_output(self) -> &'static str {
        match self {
            ModuleFormat::CommonJs => "index.cjs",
            ModuleFormat::Esm => "index.mjs",
        }
    }
}

/// What a single export is known to be.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ExportValue {
    /// A function, arrow function or class
    Function,
    /// A literal whose value is known without running the module
    Literal(Value),
    /// Present, but its value depends on runtime evaluation
    Unknown,
}

impl ExportValue {
    pub fn is_callable(&self) -> bool {
        matches!(self, ExportValue::Function)
    }
}

/// Named exports of a loaded module. `default` holds a whole-module export.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModuleExports {
    entries: BTreeMap<String, ExportValue>,
}

impl ModuleExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ExportValue) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ExportValue> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExportValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Turns source text into module exports.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, source: &str, format: ModuleFormat) -> Result<ModuleExports>;
}

/// Returns the source text under a single `default` export.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSourceLoader;

impl ModuleLoader for RawSourceLoader {
    fn load(&self, source: &str, _format: ModuleFormat) -> Result<ModuleExports> {
        let mut exports = ModuleExports::new();
        exports.insert("default", ExportValue::Literal(Value::String(source.to_string())));
        Ok(exports)
    }
}

/// Static export reader. Never evaluates the source.
///
/// Understands `module.exports = {...}`, `exports.x = ...`,
/// `Object.defineProperty(exports, "x", ...)`, esbuild's
/// `__export(target, {...})` tables, and ESM `export` declarations,
/// lists and defaults. Exports it cannot classify are reported as
/// [`ExportValue::Unknown`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportScanner;

impl ModuleLoader for ExportScanner {
    fn load(&self, source: &str, format: ModuleFormat) -> Result<ModuleExports> {
        let head = source.trim_start();
        if head.starts_with('<') {
            return Err(FetchError::ModuleLoad(
                "source looks like markup, not JavaScript".into(),
            ));
        }

        let (primary, secondary): (fn(&str) -> ModuleExports, fn(&str) -> ModuleExports) =
            match format {
                ModuleFormat::CommonJs => (scan_commonjs, scan_esm),
                ModuleFormat::Esm => (scan_esm, scan_commonjs),
            };

        let mut exports = primary(source);
        if exports.is_empty() {
            exports = secondary(source);
        }

        // A module that only forwards another module has nothing to read here
        if exports.is_empty() {
            if let Some(target) = ESM_STAR
                .captures_iter(source)
                .find(|caps| caps.get(1).is_none())
                .and_then(|caps| caps.get(2))
            {
                return Err(FetchError::ModuleLoad(format!(
                    "every export is re-exported from {}",
                    target.as_str()
                )));
            }
        }
        Ok(exports)
    }
}

static MODULE_EXPORTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bmodule\.exports\s*=\s*").unwrap());
static NAMED_EXPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w$.])(?:module\.)?exports\.([\w$]+)\s*=[^=]").unwrap());
static DEFINE_PROPERTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Object\.defineProperty\(\s*(?:module\.)?exports\s*,\s*["']([\w$]+)["']"#).unwrap()
});
static ESBUILD_EXPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b__export\(\s*[\w$]+\s*,\s*\{").unwrap());

static ESM_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bexport\s+(?:async\s+)?function\s*\*?\s*([\w$]+)").unwrap()
});
static ESM_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexport\s+class\s+([\w$]+)").unwrap());
static ESM_BINDING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexport\s+(?:const|let|var)\s+([\w$]+)\s*=\s*").unwrap());
static ESM_LIST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bexport\s*\{").unwrap());
static ESM_STAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bexport\s*\*\s*(?:as\s+([\w$]+)\s*)?from\s*["']([^"']+)["']"#).unwrap()
});
static ESM_DEFAULT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexport\s+default\s+").unwrap());

static ARROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:async\s+)?(?:\([^)]*\)|[\w$]+)\s*=>").unwrap()
});
static IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w$]+$").unwrap());
static ACCESSOR_MEMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:get|set)\s+([\w$]+)\s*\(").unwrap());
static KEY_VALUE_MEMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:([\w$]+)|"([^"]+)"|'([^']+)')\s*:\s*([\s\S]*)$"#).unwrap()
});
static METHOD_MEMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:async\s+)?\*?\s*([\w$]+)\s*\(").unwrap());

fn scan_commonjs(source: &str) -> ModuleExports {
    let mut exports = ModuleExports::new();

    // The last whole-object assignment wins
    if let Some(m) = MODULE_EXPORTS.find_iter(source).last() {
        let rest = &source[m.end()..];
        if rest.starts_with('{') {
            for member in object_members(source, m.end()) {
                scan_member(source, member, false, &mut exports);
            }
        } else if !rest.starts_with("__toCommonJS") {
            exports.insert("default", classify_value(source, statement_text(rest)));
        }
    }

    for m in ESBUILD_EXPORT.find_iter(source) {
        for member in object_members(source, m.end() - 1) {
            scan_member(source, member, true, &mut exports);
        }
    }

    for caps in NAMED_EXPORT.captures_iter(source) {
        let (Some(name), Some(whole)) = (caps.get(1), caps.get(0)) else {
            continue;
        };
        if name.as_str() == "__esModule" {
            continue;
        }
        // `=[^=]` also consumed the first character of the value
        let value_start = whole
            .as_str()
            .rfind('=')
            .map(|eq| whole.start() + eq + 1)
            .unwrap_or(whole.end());
        let value = statement_text(&source[value_start..]);
        exports.insert(name.as_str(), classify_value(source, value));
    }

    for caps in DEFINE_PROPERTY.captures_iter(source) {
        if let Some(name) = caps.get(1).filter(|n| n.as_str() != "__esModule") {
            if !exports.contains(name.as_str()) {
                exports.insert(name.as_str(), ExportValue::Unknown);
            }
        }
    }

    exports
}

fn scan_esm(source: &str) -> ModuleExports {
    let mut exports = ModuleExports::new();

    for caps in ESM_FUNCTION.captures_iter(source).chain(ESM_CLASS.captures_iter(source)) {
        if let Some(name) = caps.get(1) {
            exports.insert(name.as_str(), ExportValue::Function);
        }
    }

    for caps in ESM_BINDING.captures_iter(source) {
        if let (Some(name), Some(whole)) = (caps.get(1), caps.get(0)) {
            let value = statement_text(&source[whole.end()..]);
            exports.insert(name.as_str(), classify_value(source, value));
        }
    }

    for m in ESM_LIST.find_iter(source) {
        let members = object_members(source, m.end() - 1);
        let reexport = source[m.end()..]
            .find('}')
            .map(|close| source[m.end() + close + 1..].trim_start().starts_with("from"))
            .unwrap_or(false);

        for member in members {
            let member = member.trim();
            if member.is_empty() {
                continue;
            }
            let (local, exported) = match member.split_once(" as ") {
                Some((local, exported)) => (local.trim(), exported.trim()),
                None => (member, member),
            };
            let value = if reexport {
                ExportValue::Unknown
            } else {
                classify_binding(source, local)
            };
            exports.insert(exported, value);
        }
    }

    for caps in ESM_STAR.captures_iter(source) {
        if let Some(namespace) = caps.get(1) {
            exports.insert(namespace.as_str(), ExportValue::Unknown);
        }
    }

    if let Some(m) = ESM_DEFAULT.find(source) {
        let value = statement_text(&source[m.end()..]);
        exports.insert("default", classify_value(source, value));
    }

    exports
}

/// Classify one `{ ... }` member. In esbuild tables every value is a getter
/// returning the real binding.
fn scan_member(source: &str, member: &str, getter_table: bool, exports: &mut ModuleExports) {
    let member = strip_leading_comments(member);
    if member.is_empty() || member.starts_with("...") {
        return;
    }

    if let Some(caps) = ACCESSOR_MEMBER.captures(member) {
        exports.insert(&caps[1], ExportValue::Unknown);
        return;
    }

    if let Some(caps) = KEY_VALUE_MEMBER.captures(member) {
        let key = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|k| k.as_str())
            .unwrap_or_default();
        let value = caps.get(4).map(|v| v.as_str().trim()).unwrap_or_default();

        let classified = if getter_table {
            match value.split_once("=>") {
                Some((_, body)) => classify_value(source, body.trim()),
                None => ExportValue::Unknown,
            }
        } else {
            classify_value(source, value)
        };
        exports.insert(key, classified);
        return;
    }

    if let Some(caps) = METHOD_MEMBER.captures(member) {
        exports.insert(&caps[1], ExportValue::Function);
        return;
    }

    if IDENT.is_match(member) {
        exports.insert(member, classify_binding(source, member));
    }
}

fn classify_value(source: &str, value: &str) -> ExportValue {
    let value = value.trim().trim_end_matches(';').trim();

    if value.starts_with("function") || value.starts_with("class ") || value.starts_with("async ") {
        return ExportValue::Function;
    }
    if ARROW.is_match(value) {
        return ExportValue::Function;
    }
    if let Ok(literal) = serde_json::from_str::<Value>(value) {
        return ExportValue::Literal(literal);
    }
    if let Some(inner) = value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
        if !inner.contains('\'') {
            return ExportValue::Literal(Value::String(inner.to_string()));
        }
    }
    if IDENT.is_match(value) {
        return classify_binding(source, value);
    }

    ExportValue::Unknown
}

/// Look up how a local identifier is declared.
fn classify_binding(source: &str, ident: &str) -> ExportValue {
    let ident = regex::escape(ident);
    let patterns = [
        format!(r"\bfunction\s*\*?\s*{}\s*\(", ident),
        format!(r"\bclass\s+{}\b", ident),
        format!(
            r"\b(?:const|let|var)\s+{}\s*=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*=>|[\w$]+\s*=>|class\b)",
            ident
        ),
    ];

    let callable = patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .any(|re| re.is_match(source));

    if callable {
        ExportValue::Function
    } else {
        ExportValue::Unknown
    }
}

fn strip_leading_comments(mut text: &str) -> &str {
    loop {
        text = text.trim_start();
        if let Some(rest) = text.strip_prefix("//") {
            text = rest.split_once('\n').map(|(_, after)| after).unwrap_or("");
        } else if let Some(rest) = text.strip_prefix("/*") {
            text = rest.split_once("*/").map(|(_, after)| after).unwrap_or("");
        } else {
            return text.trim_end();
        }
    }
}

/// Text of a statement up to the first `;` or newline.
fn statement_text(rest: &str) -> &str {
    let end = rest.find([';', '\n']).unwrap_or(rest.len());
    rest[..end].trim()
}

/// Split the object literal opening at `open` into its top-level members.
///
/// Tracks nesting, string literals and comments; an unterminated literal
/// yields the members seen so far.
fn object_members(source: &str, open: usize) -> Vec<&str> {
    let bytes = source.as_bytes();
    let mut members = Vec::new();
    let mut depth = 0usize;
    let mut start = open + 1;
    let mut i = open + 1;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'"' | b'\'' | b'`') => {
                i = skip_string(bytes, i, quote);
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
                continue;
            }
            b'{' | b'(' | b'[' => depth += 1,
            b'}' | b')' | b']' => {
                if depth == 0 {
                    members.push(&source[start..i]);
                    return members;
                }
                depth -= 1;
            }
            b',' if depth == 0 => {
                members.push(&source[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }

    members
}

/// Index just past the string literal starting at `start`.
fn skip_string(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}
