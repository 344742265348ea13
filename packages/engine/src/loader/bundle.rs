//! Single-artifact bundling.
//!
//! A bundle is a self-contained module map: the entry path plus every source
//! the job may import, keyed by bundle-local paths (`_shared/…` for the
//! library folder). Serialization is deterministic (same inputs, same bytes),
//! so re-registering unchanged code is a no-op at the storage layer. The
//! sandbox's module loader resolves imports against the map and performs the
//! TypeScript transform on its side of the boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Bundle {
    /// Bundle-local path of the entry module.
    pub entry: String,
    /// Bundle-local path → source text.
    pub files: BTreeMap<String, String>,
}

impl Bundle {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn add_file(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.files.insert(path.into(), source.into());
    }

    /// Serialize to the artifact stored on the function row.
    pub fn to_artifact(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| EngineError::Validation(format!("bundle serialization failed: {e}")))
    }

    pub fn from_artifact(artifact: &str) -> Result<Self> {
        serde_json::from_str(artifact)
            .map_err(|e| EngineError::Validation(format!("malformed bundle artifact: {e}")))
    }

    /// Resolve a relative import from `from` against the bundle namespace.
    ///
    /// Returns the bundle-local path of the target module, or `None` when the
    /// specifier is absolute/bare or escapes the bundle.
    pub fn resolve_import(&self, from: &str, specifier: &str) -> Option<String> {
        if !specifier.starts_with("./") && !specifier.starts_with("../") {
            return None;
        }

        let mut segments: Vec<&str> = from.split('/').collect();
        segments.pop(); // drop the importing file itself

        for part in specifier.split('/') {
            match part {
                "." | "" => {}
                ".." => {
                    segments.pop()?;
                }
                name => segments.push(name),
            }
        }

        let resolved = segments.join("/");
        if self.files.contains_key(&resolved) {
            return Some(resolved);
        }

        // Extensionless specifiers fall back to the known source extensions.
        for ext in ["ts", "js", "mts", "mjs"] {
            let candidate = format!("{resolved}.{ext}");
            if self.files.contains_key(&candidate) {
                return Some(candidate);
            }
        }

        None
    }
}
