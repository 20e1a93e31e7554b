//! Component version records.
//!
//! Versions baked into the image at build time live in an environment-format
//! file (`KEY=value` per line). The registry is loaded once at startup, passed
//! to whoever needs it, and written back atomically when something changed.
//!
//! The file is shared with the rest of the image, so saving keeps every line
//! it did not touch byte-for-byte: comments, ordering, and unexpanded `$VAR`
//! references survive. Changed keys are rewritten in place and new keys are
//! appended.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::fs::write_atomic;
use crate::utils::{EntrypointError, Result};

/// Typed view over the version records file.
#[derive(Debug, Clone)]
pub struct VersionRegistry {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    /// File contents as read, one entry per line
    lines: Vec<String>,
    changed: BTreeSet<String>,
}

impl VersionRegistry {
    /// Empty registry bound to `path`; nothing is read.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
            lines: Vec::new(),
            changed: BTreeSet::new(),
        }
    }

    /// Load the registry. A missing file yields an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        let mut registry = Self::empty(path);
        if !path.exists() {
            return Ok(registry);
        }

        let iter = dotenvy::from_path_iter(path)
            .map_err(|e| EntrypointError::Registry(format!("{}: {}", path.display(), e)))?;
        for item in iter {
            let (key, value) = item
                .map_err(|e| EntrypointError::Registry(format!("{}: {}", path.display(), e)))?;
            registry.entries.insert(key, value);
        }

        let raw = std::fs::read_to_string(path).map_err(|e| EntrypointError::io_at(path, e))?;
        registry.lines = raw.lines().map(str::to_string).collect();

        tracing::debug!(
            path = %path.display(),
            entries = registry.entries.len(),
            "Version registry loaded"
        );
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Set a record; returns true when the stored value changed.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let value = value.into();
        if self.entries.get(&key) == Some(&value) {
            return false;
        }
        self.entries.insert(key.clone(), value);
        self.changed.insert(key);
        true
    }

    pub fn is_dirty(&self) -> bool {
        !self.changed.is_empty()
    }

    /// The file as it will be written: original lines with changed records
    /// replaced in place, then records that were not in the file.
    fn render(&self) -> String {
        let mut written = BTreeSet::new();
        let mut out = String::new();

        for line in &self.lines {
            match assignment_key(line) {
                Some((export, key)) if self.changed.contains(key) => {
                    let value = self.entries.get(key).map(String::as_str).unwrap_or_default();
                    out.push_str(export);
                    out.push_str(&format!("{}={}\n", key, quote(value)));
                    written.insert(key);
                }
                _ => {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }

        for key in self.changed.iter().filter(|k| !written.contains(k.as_str())) {
            if let Some(value) = self.entries.get(key) {
                out.push_str(&format!("{}={}\n", key, quote(value)));
            }
        }
        out
    }

    /// Write back atomically when modified. Returns whether a write happened.
    pub fn save(&mut self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        let rendered = self.render();
        write_atomic(&self.path, rendered.as_bytes())
            .map_err(|e| EntrypointError::io_at(&self.path, e))?;
        self.lines = rendered.lines().map(str::to_string).collect();
        self.changed.clear();
        tracing::debug!(path = %self.path.display(), "Version registry saved");
        Ok(true)
    }
}

/// Split an assignment line into its `export ` prefix and key.
fn assignment_key(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let (export, rest) = match trimmed.strip_prefix("export ") {
        Some(rest) => ("export ", rest.trim_start()),
        None => ("", trimmed),
    };
    let (key, _) = rest.split_once('=')?;
    let key = key.trim_end();
    let valid = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.'));
    valid.then_some((export, key))
}

fn quote(value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '+'));
    if plain && !value.is_empty() {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}
