//! package.json parsing and entry-point selection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{FetchError, Result};

/// Entry point used when a manifest has no `main`.
pub const DEFAULT_MAIN: &str = "index.js";

/// The parts of an extracted package.json the resolver reads.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Package name
    pub name: Option<String>,

    /// Package version
    pub version: Option<String>,

    /// Main entry point
    pub main: Option<String>,

    /// Module entry point (ES modules)
    pub module: Option<String>,

    /// Package type (commonjs or module)
    #[serde(rename = "type")]
    pub package_type: Option<String>,

    /// Exports field (package exports), in declared order
    pub exports: Option<Value>,

    /// Additional fields not explicitly defined
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PackageManifest {
    /// Read package.json from a file path.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse package.json content.
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(FetchError::from)
    }

    /// `main`, or [`DEFAULT_MAIN`] when absent or blank.
    pub fn main_or_default(&self) -> &str {
        self.main
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MAIN)
    }

    /// Pick the file to read for a requested output filename.
    ///
    /// `main` is used unless `output` is absent from it and an `exports` entry
    /// has an `import` or `require` target containing `output`. Entries are
    /// scanned in declared order and `import` is checked before `require`.
    /// Without a match `main` is returned as-is.
    pub fn entry_point(&self, output: Option<&str>) -> String {
        let main = self.main_or_default();

        let Some(output) = output.filter(|o| !o.is_empty()) else {
            return main.to_string();
        };
        if main.contains(output) {
            return main.to_string();
        }

        let Some(Value::Object(entries)) = &self.exports else {
            return main.to_string();
        };

        for entry in entries.values() {
            let Value::Object(conditions) = entry else {
                continue;
            };
            for condition in ["import", "require"] {
                if let Some(target) = conditions.get(condition).and_then(condition_target) {
                    if target.contains(output) {
                        return target.to_string();
                    }
                }
            }
        }

        main.to_string()
    }
}

/// A condition target is either a path or a nested `{ default: path }`.
fn condition_target(value: &Value) -> Option<&str> {
    match value {
        Value::String(path) => Some(path.as_str()),
        Value::Object(nested) => nested.get("default").and_then(Value::as_str),
        _ => None,
    }
}
