//! `meta.json` descriptors shipped inside plugin directories.
//!
//! Only `status` and `category` are interpreted; every other key is preserved
//! as-is when the descriptor is written back.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::fs::write_atomic;
use crate::utils::{EntrypointError, Result};

pub const META_FILE: &str = "meta.json";
pub const STATUS_ACTIVE: &str = "Active";
pub const STATUS_DISABLED: &str = "Disabled";
pub const DEFAULT_CATEGORY: &str = "General";

pub struct PluginMeta {
    path: PathBuf,
    fields: Map<String, Value>,
}

impl PluginMeta {
    /// Load `<plugin_dir>/meta.json`; `Ok(None)` when there is none.
    pub fn load(plugin_dir: &Path) -> Result<Option<Self>> {
        let path = plugin_dir.join(META_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EntrypointError::io_at(&path, e)),
        };

        match serde_json::from_str::<Value>(&content)? {
            Value::Object(fields) => Ok(Some(Self { path, fields })),
            _ => Err(EntrypointError::Plugin(format!(
                "{}: descriptor is not a JSON object",
                path.display()
            ))),
        }
    }

    pub fn status(&self) -> Option<&str> {
        self.fields.get("status").and_then(Value::as_str)
    }

    pub fn category(&self) -> Option<&str> {
        self.fields.get("category").and_then(Value::as_str)
    }

    /// Fill empty or missing `status`/`category`. Returns whether anything changed.
    pub fn apply_defaults(&mut self) -> bool {
        let mut changed = false;
        for (key, default) in [("status", STATUS_ACTIVE), ("category", DEFAULT_CATEGORY)] {
            let blank = self
                .fields
                .get(key)
                .and_then(Value::as_str)
                .map_or(true, |v| v.trim().is_empty());
            if blank {
                self.fields.insert(key.to_string(), Value::String(default.to_string()));
                changed = true;
            }
        }
        changed
    }

    /// Set `status`; returns whether it changed.
    pub fn set_status(&mut self, status: &str) -> bool {
        if self.status() == Some(status) {
            return false;
        }
        self.fields.insert("status".to_string(), Value::String(status.to_string()));
        true
    }

    pub fn save(&self) -> Result<()> {
        let body = serde_json::to_vec_pretty(&self.fields)?;
        write_atomic(&self.path, &body).map_err(|e| EntrypointError::io_at(&self.path, e))
    }
}

/// Set the status of every installed directory of `name` under `plugin_dir`.
/// Returns how many descriptors were rewritten.
pub fn set_plugin_status(plugin_dir: &Path, name: &str, status: &str) -> Result<usize> {
    let mut updated = 0;
    for (_, dir) in super::installed_versions(plugin_dir, name)? {
        match PluginMeta::load(&dir)? {
            Some(mut meta) => {
                if meta.set_status(status) {
                    meta.save()?;
                    updated += 1;
                }
            }
            None => {
                tracing::warn!(plugin = %name, dir = %dir.display(), "No meta.json, status left unchanged");
            }
        }
    }
    Ok(updated)
}

/// Re-activate descriptors of `name` that a previous run disabled.
/// Other statuses are left to the server.
pub fn reenable_plugin(plugin_dir: &Path, name: &str) -> Result<usize> {
    let mut updated = 0;
    for (_, dir) in super::installed_versions(plugin_dir, name)? {
        if let Some(mut meta) = PluginMeta::load(&dir)? {
            if meta.status() == Some(STATUS_DISABLED) {
                meta.set_status(STATUS_ACTIVE);
                meta.save()?;
                updated += 1;
            }
        }
    }
    Ok(updated)
}
