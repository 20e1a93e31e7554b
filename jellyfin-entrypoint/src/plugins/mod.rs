//! Plugin provisioning.
//!
//! Reconciles the plugins baked into the image against the plugin install
//! root on the volume. Each plugin lives in `<name>_<version>`; after a run
//! exactly one version directory per declared plugin remains.
//!
//! | installed | comparison          | action                              |
//! |-----------|---------------------|-------------------------------------|
//! | none      |                     | install desired                     |
//! | present   | desired > installed | install desired, drop old versions  |
//! | present   | desired <= installed| skip                                |

pub mod bundle;
pub mod meta;
pub mod version;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::PluginSpec;
use crate::fs::permissions::{set_tree_mode, WORLD_READABLE_EXECUTABLE};
use crate::registry::VersionRegistry;
use crate::utils::{EntrypointError, Result};
use meta::PluginMeta;
use version::PluginVersion;

const STAGING_SUFFIX: &str = ".staging";

/// What happened to one declared plugin
#[derive(Debug, Clone, PartialEq)]
pub enum PluginAction {
    Installed { version: String },
    Upgraded { from: String, to: String },
    Skipped { installed: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginOutcome {
    pub name: String,
    pub registry_key: String,
    pub action: PluginAction,
}

impl PluginOutcome {
    /// Version present on disk after this run, if any.
    pub fn current_version(&self) -> Option<&str> {
        match &self.action {
            PluginAction::Installed { version } => Some(version),
            PluginAction::Upgraded { to, .. } => Some(to),
            PluginAction::Skipped { installed } => Some(installed),
            PluginAction::Failed { .. } => None,
        }
    }
}

impl fmt::Display for PluginAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginAction::Installed { version } => write!(f, "installed {version}"),
            PluginAction::Upgraded { from, to } => write!(f, "upgraded {from} -> {to}"),
            PluginAction::Skipped { installed } => write!(f, "already current ({installed})"),
            PluginAction::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ProvisionReport {
    pub outcomes: Vec<PluginOutcome>,
}

impl ProvisionReport {
    /// Every declared plugin is installed or already current.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| !matches!(o.action, PluginAction::Failed { .. }))
    }

    pub fn failures(&self) -> impl Iterator<Item = &PluginOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.action, PluginAction::Failed { .. }))
    }

    /// Record `<KEY>_INSTALLED` for every plugin with a version on disk.
    pub fn record_into(&self, registry: &mut VersionRegistry) {
        for outcome in &self.outcomes {
            if let Some(version) = outcome.current_version() {
                registry.set(format!("{}_INSTALLED", outcome.registry_key), version);
            }
        }
    }
}

/// Installed `<name>_<version>` directories, lowest version first.
/// Entries whose suffix is not a version are ignored.
pub fn installed_versions(plugin_dir: &Path, name: &str) -> Result<Vec<(PluginVersion, PathBuf)>> {
    let read_dir = match fs::read_dir(plugin_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EntrypointError::io_at(plugin_dir, e)),
    };

    let prefix = format!("{name}_");
    let mut versions: Vec<(PluginVersion, PathBuf)> = read_dir
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| {
            let file_name = e.file_name().to_string_lossy().to_string();
            let version = file_name.strip_prefix(&prefix)?.parse::<PluginVersion>().ok()?;
            Some((version, e.path()))
        })
        .collect();

    versions.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(versions)
}

pub struct PluginProvisioner {
    plugin_dir: PathBuf,
    plugins: Vec<PluginSpec>,
}

impl PluginProvisioner {
    pub fn new(plugin_dir: PathBuf, plugins: Vec<PluginSpec>) -> Self {
        Self { plugin_dir, plugins }
    }

    /// Reconcile every declared plugin. Never fails as a whole: per-plugin
    /// problems are reported in the outcome list.
    pub fn provision(&self, registry: &VersionRegistry) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        if self.plugins.is_empty() {
            return report;
        }

        if let Err(e) = fs::create_dir_all(&self.plugin_dir) {
            tracing::warn!(dir = %self.plugin_dir.display(), error = %e, "Cannot create plugin directory");
        }
        self.sweep_staging();

        for spec in &self.plugins {
            let action = match self.provision_one(spec, registry) {
                Ok(action) => action,
                Err(e) => PluginAction::Failed {
                    reason: e.to_string(),
                },
            };

            match &action {
                PluginAction::Failed { reason } => {
                    tracing::warn!(plugin = %spec.name, reason = %reason, "Plugin not provisioned")
                }
                PluginAction::Skipped { installed } => {
                    tracing::info!(plugin = %spec.name, installed = %installed, "Plugin already current, skipping")
                }
                other => tracing::info!(plugin = %spec.name, "Plugin {}", other),
            }

            report.outcomes.push(PluginOutcome {
                name: spec.name.clone(),
                registry_key: spec.registry_key(),
                action,
            });
        }

        report
    }

    fn provision_one(&self, spec: &PluginSpec, registry: &VersionRegistry) -> Result<PluginAction> {
        let key = spec.registry_key();
        let desired_raw = spec
            .version
            .as_deref()
            .or_else(|| registry.get(&key))
            .ok_or_else(|| {
                EntrypointError::Plugin(format!("no desired version (set `version` or {key})"))
            })?;
        let desired: PluginVersion = desired_raw.parse()?;

        let installed = installed_versions(&self.plugin_dir, &spec.name)?;
        if let Some((current, _)) = installed.last() {
            if desired <= *current {
                let current = current.clone();
                self.remove_versions(spec, installed.iter().filter(|(v, _)| *v != current));
                return Ok(PluginAction::Skipped {
                    installed: current.to_string(),
                });
            }
        }

        let source = PathBuf::from(spec.source.replace("{version}", desired.as_str()));
        if !source.exists() {
            return Err(EntrypointError::Plugin(format!(
                "source bundle missing: {}",
                source.display()
            )));
        }

        let target = self.plugin_dir.join(format!("{}_{}", spec.name, desired));
        self.install(spec, &source, &target)?;
        self.remove_versions(spec, installed.iter().filter(|(_, p)| *p != target));

        Ok(match installed.last() {
            Some((previous, _)) => PluginAction::Upgraded {
                from: previous.to_string(),
                to: desired.to_string(),
            },
            None => PluginAction::Installed {
                version: desired.to_string(),
            },
        })
    }

    /// Stage into a hidden sibling, validate, then move into place.
    fn install(&self, spec: &PluginSpec, source: &Path, target: &Path) -> Result<()> {
        let target_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let staging = self.plugin_dir.join(format!(".{target_name}{STAGING_SUFFIX}"));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| EntrypointError::io_at(&staging, e))?;
        }

        let result = self.prepare_staging(spec, source, &staging).and_then(|files| {
            if target.exists() {
                fs::remove_dir_all(target).map_err(|e| EntrypointError::io_at(target, e))?;
            }
            fs::rename(&staging, target).map_err(|e| EntrypointError::io_at(target, e))?;
            Ok(files)
        });

        match result {
            Ok(files) => {
                tracing::debug!(plugin = %spec.name, files, target = %target.display(), "Plugin files installed");
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(e)
            }
        }
    }

    fn prepare_staging(&self, spec: &PluginSpec, source: &Path, staging: &Path) -> Result<u64> {
        let files = bundle::stage_bundle(source, staging)?;

        if let Some(entry_point) = &spec.entry_point {
            if !staging.join(entry_point).is_file() {
                return Err(EntrypointError::Plugin(format!(
                    "entry point {entry_point} not found in {}",
                    source.display()
                )));
            }
        }

        if let Some(mut meta) = PluginMeta::load(staging)? {
            if meta.apply_defaults() {
                tracing::info!(plugin = %spec.name, "Filled empty status/category in meta.json");
                meta.save()?;
            }
        }

        set_tree_mode(staging, WORLD_READABLE_EXECUTABLE)
            .map_err(|e| EntrypointError::io_at(staging, e))?;
        Ok(files)
    }

    fn remove_versions<'a>(
        &self,
        spec: &PluginSpec,
        stale: impl Iterator<Item = &'a (PluginVersion, PathBuf)>,
    ) {
        for (version, path) in stale {
            match fs::remove_dir_all(path) {
                Ok(()) => {
                    tracing::info!(plugin = %spec.name, version = %version, "Removed old plugin version")
                }
                Err(e) => tracing::warn!(
                    plugin = %spec.name,
                    version = %version,
                    error = %e,
                    "Failed to remove old plugin version"
                ),
            }
        }
    }

    /// Staging directories left behind by an interrupted run.
    fn sweep_staging(&self) {
        let Ok(read_dir) = fs::read_dir(&self.plugin_dir) else {
            return;
        };
        for entry in read_dir.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') && name.ends_with(STAGING_SUFFIX) {
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    tracing::warn!(dir = %entry.path().display(), error = %e, "Failed to remove stale staging directory");
                }
            }
        }
    }
}
