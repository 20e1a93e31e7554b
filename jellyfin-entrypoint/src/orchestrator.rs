//! Startup sequence.
//!
//! validate launch command -> build signature -> backup decision ->
//! fixups + provisioning (concurrent) -> backup when due -> join ->
//! configuration patches -> sidecar -> container marker -> handoff.
//!
//! Only an invalid launch command stops startup. Everything else degrades to
//! a warning and is retried on the next start.

use chrono::Local;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use crate::backup::{BackupDecision, BackupManager, BackupRun, PruneJob};
use crate::config::Config;
use crate::daemon::shutdown::ShutdownCoordinator;
use crate::daemon::{Handoff, LaunchCommand};
use crate::fixups;
use crate::fs::write_atomic;
use crate::patcher::{self, PatchSummary};
use crate::plugins::{PluginProvisioner, ProvisionReport};
use crate::registry::VersionRegistry;
use crate::sidecar::{SidecarState, SidecarSupervisor};
use crate::signature::BuildSignature;
use crate::utils::Result;

/// Where retention pruning runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneMode {
    /// Detached `prune-backups` child process that outlives the handoff
    Detached,
    /// Blocking task inside this process, not awaited
    Background,
}

/// What one startup did, for logging and tests
#[derive(Debug)]
pub struct StartupReport {
    pub signature: BuildSignature,
    pub decision: BackupDecision,
    pub backup: Option<BackupRun>,
    pub provision: ProvisionReport,
    pub fixup_failures: usize,
    pub patch: Option<PatchSummary>,
    pub sidecar: SidecarState,
    pub marker_created: bool,
}

pub struct StartupOrchestrator {
    config: Config,
    prune_mode: PruneMode,
}

impl StartupOrchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            prune_mode: PruneMode::Detached,
        }
    }

    pub fn with_prune_mode(mut self, mode: PruneMode) -> Self {
        self.prune_mode = mode;
        self
    }

    fn backup_manager(&self) -> BackupManager {
        BackupManager::new(self.config.paths.clone(), self.config.backup.clone())
    }

    /// Current backup decision, without acting on it.
    pub fn check_backup(&self) -> Result<(BuildSignature, BackupDecision)> {
        let signature = BuildSignature::compute(&self.config.signature.artifacts);
        let decision = self.backup_manager().decide(&signature)?;
        Ok((signature, decision))
    }

    /// Full startup, then hand off. Returns the exit code when the
    /// entrypoint stays as the parent.
    pub async fn run(self, argv: Vec<OsString>) -> Result<i32> {
        // Before anything is spawned, so a request during startup is held
        let signals = ShutdownCoordinator::install()?.listen();
        let (handoff, _) = self.prepare(argv).await?;
        tracing::info!(command = %handoff.command(), "Launching server");
        handoff.run(signals).await
    }

    /// Everything up to, but not including, the handoff.
    pub async fn prepare(&self, argv: Vec<OsString>) -> Result<(Handoff, StartupReport)> {
        let command = LaunchCommand::resolve(argv)?;
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            program = %command.program().display(),
            "Entrypoint starting"
        );

        let mut registry = match VersionRegistry::load(&self.config.registry.path) {
            Ok(registry) => Some(registry),
            Err(e) => {
                tracing::warn!(error = %e, "Version registry unreadable, it will not be updated");
                None
            }
        };
        let mut scratch = VersionRegistry::empty(&self.config.registry.path);

        let signature = BuildSignature::compute(&self.config.signature.artifacts);
        let manager = self.backup_manager();
        let decision = manager.decide(&signature).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Recorded signature unreadable, treating as no history");
            crate::backup::is_backup_due(self.config.paths.marker_file().exists(), None, &signature)
        });
        tracing::info!(signature = %signature, due = decision.due, reason = %decision.reason, "Backup decision");

        let fixups_task = tokio::spawn(fixups::run_fixups(self.config.fixups.clone()));

        let provisioner =
            PluginProvisioner::new(self.config.paths.plugin_dir.clone(), self.config.plugins.clone());
        let snapshot = registry.clone().unwrap_or_else(|| scratch.clone());
        let provision_task = tokio::task::spawn_blocking(move || provisioner.provision(&snapshot));

        let backup = if decision.due {
            Some(self.run_backup(manager, signature.clone()).await)
        } else {
            tracing::info!("Backup not needed");
            None
        };

        let fixup_failures = match fixups_task.await {
            Ok(failed) => failed,
            Err(e) => {
                tracing::warn!(error = %e, "Fixup task failed");
                self.config.fixups.len()
            }
        };
        let provision = match provision_task.await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "Plugin provisioning task failed");
                ProvisionReport::default()
            }
        };
        if !provision.all_succeeded() {
            tracing::warn!(
                failed = provision.failures().count(),
                "Some plugins were not provisioned, continuing startup"
            );
        }

        let active = registry.as_mut().unwrap_or(&mut scratch);
        provision.record_into(active);

        let patch = self.patch_configuration();

        let mut sidecar = SidecarSupervisor::new(
            self.config.sidecar.clone(),
            self.config.paths.plugin_dir.clone(),
        );
        let sidecar_state = sidecar.start(active).await.clone();

        if let Some(registry) = registry.as_mut() {
            match registry.save() {
                Ok(true) => tracing::info!(path = %registry.path().display(), "Version registry updated"),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to save version registry"),
            }
        }

        let marker_created = self.ensure_marker();

        let report = StartupReport {
            signature,
            decision,
            backup,
            provision,
            fixup_failures,
            patch,
            sidecar: sidecar_state,
            marker_created,
        };

        let handoff = if sidecar.is_running() {
            Handoff::Supervise { command, sidecar }
        } else {
            Handoff::Exec(command)
        };
        Ok((handoff, report))
    }

    /// Archives are written on the critical path; pruning is not.
    async fn run_backup(&self, manager: BackupManager, signature: BuildSignature) -> BackupRun {
        tracing::info!("Creating backups");
        match tokio::task::spawn_blocking(move || {
            let run = manager.run(&signature, Local::now());
            let jobs = manager.prune_jobs(&run);
            (run, jobs)
        })
        .await
        {
            Ok((run, jobs)) => {
                self.dispatch_pruning(jobs);
                run
            }
            Err(e) => {
                tracing::warn!(error = %e, "Backup task failed");
                BackupRun {
                    failed: true,
                    ..BackupRun::default()
                }
            }
        }
    }

    fn dispatch_pruning(&self, jobs: Vec<PruneJob>) {
        for job in jobs {
            if self.prune_mode == PruneMode::Detached {
                match spawn_prune_process(&job) {
                    Ok(pid) => {
                        tracing::debug!(prefix = %job.prefix, pid, "Pruning dispatched");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Cannot start pruning process, pruning in-process")
                    }
                }
            }

            tokio::task::spawn_blocking(move || match job.execute() {
                Ok(report) => tracing::info!(prefix = %job.prefix, deleted = report.deleted.len(), "Old backups pruned"),
                Err(e) => tracing::warn!(prefix = %job.prefix, error = %e, "Backup pruning failed"),
            });
        }
    }

    fn patch_configuration(&self) -> Option<PatchSummary> {
        let path = self.config.paths.server_config_file();
        let flags: Vec<(String, String)> = self
            .config
            .flags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        match patcher::patch_server_config(&path, &self.config.repositories, &flags) {
            Ok(summary) => {
                if summary.written {
                    tracing::info!(path = %path.display(), changes = summary.changes, "Server configuration patched");
                }
                Some(summary)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Server configuration not patched");
                None
            }
        }
    }

    /// Create the marker on first start. Returns whether it was created now.
    fn ensure_marker(&self) -> bool {
        let marker = self.config.paths.marker_file();
        if marker.exists() {
            return false;
        }
        let stamp = format!("{}\n", Local::now().to_rfc3339());
        match write_atomic(&marker, stamp.as_bytes()) {
            Ok(()) => {
                tracing::info!(path = %marker.display(), "Container marked as initialized");
                true
            }
            Err(e) => {
                tracing::warn!(path = %marker.display(), error = %e, "Failed to create container marker");
                false
            }
        }
    }
}

/// Re-invoke this binary as `prune-backups` in its own process group.
fn spawn_prune_process(job: &PruneJob) -> std::io::Result<u32> {
    use std::os::unix::process::CommandExt;

    let exe: PathBuf = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("prune-backups")
        .arg("--dir")
        .arg(&job.dir)
        .arg("--prefix")
        .arg(&job.prefix)
        .arg("--keep")
        .arg(job.keep.to_string());
    if let Some(protect) = &job.protect {
        command.arg("--protect").arg(protect);
    }
    let child = command
        .stdin(Stdio::null())
        .process_group(0)
        .spawn()?;
    Ok(child.id())
}
