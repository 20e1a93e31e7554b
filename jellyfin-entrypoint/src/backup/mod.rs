//! Backup manager: decides whether a snapshot is owed and takes it.
//!
//! A backup is owed on a fresh volume and whenever the image was rebuilt since
//! the last recorded backup. Archive creation sits on the startup critical
//! path; retention pruning does not.

pub mod archive;
pub mod retention;

use chrono::{DateTime, Local};
use std::fmt;
use std::path::PathBuf;

use crate::config::{BackupConfig, PathsConfig};
use crate::signature::BuildSignature;
use crate::utils::Result;

/// Why a backup is, or is not, due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupReason {
    NewInstance,
    NoHistory,
    ImageUpdated,
    UpToDate,
}

impl BackupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupReason::NewInstance => "new instance",
            BackupReason::NoHistory => "no history",
            BackupReason::ImageUpdated => "image updated",
            BackupReason::UpToDate => "up to date",
        }
    }
}

impl fmt::Display for BackupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupDecision {
    pub due: bool,
    pub reason: BackupReason,
}

/// Pure decision over the persisted state, in priority order.
pub fn is_backup_due(
    marker_exists: bool,
    last_signature: Option<&BuildSignature>,
    current: &BuildSignature,
) -> BackupDecision {
    let reason = match (marker_exists, last_signature) {
        (false, _) => BackupReason::NewInstance,
        (true, None) => BackupReason::NoHistory,
        (true, Some(last)) if last != current => BackupReason::ImageUpdated,
        (true, Some(_)) => BackupReason::UpToDate,
    };
    BackupDecision {
        due: reason != BackupReason::UpToDate,
        reason,
    }
}

/// Archives produced by one backup run
#[derive(Debug, Default)]
pub struct BackupRun {
    pub database: Option<PathBuf>,
    pub config: Option<PathBuf>,
    /// Set when an archive could not be written; the signature is then left
    /// untouched so the next start retries.
    pub failed: bool,
    pub signature_recorded: bool,
}

/// Retention work handed off once the archives exist
#[derive(Debug, Clone)]
pub struct PruneJob {
    pub dir: PathBuf,
    pub prefix: String,
    pub keep: usize,
    pub protect: Option<PathBuf>,
}

pub struct BackupManager {
    paths: PathsConfig,
    backup: BackupConfig,
}

impl BackupManager {
    pub fn new(paths: PathsConfig, backup: BackupConfig) -> Self {
        Self { paths, backup }
    }

    /// Read the marker and the recorded signature and decide.
    pub fn decide(&self, current: &BuildSignature) -> Result<BackupDecision> {
        let marker_exists = self.paths.marker_file().exists();
        let last = BuildSignature::read_recorded(&self.paths.signature_file())?;
        Ok(is_backup_due(marker_exists, last.as_ref(), current))
    }

    /// Back up the database, then the configuration tree, then record the
    /// signature. Archive failures are logged and never propagate.
    pub fn run(&self, current: &BuildSignature, timestamp: DateTime<Local>) -> BackupRun {
        let mut run = BackupRun::default();

        match archive::backup_database(
            &self.paths.data_dir,
            &self.backup.database_files,
            &self.paths.backup_dir,
            &self.backup.database_prefix,
            &timestamp,
        ) {
            Ok(archive) => run.database = archive,
            Err(e) => {
                tracing::warn!(error = %e, "Database backup failed, continuing startup");
                run.failed = true;
            }
        }

        match archive::backup_config(
            &self.paths.config_dir,
            &self.paths.backup_dir,
            &self.backup.config_prefix,
            &timestamp,
        ) {
            Ok(archive) => run.config = archive,
            Err(e) => {
                tracing::warn!(error = %e, "Configuration backup failed, continuing startup");
                run.failed = true;
            }
        }

        if run.failed {
            tracing::warn!("Build signature not recorded, backup will be retried on next start");
            return run;
        }

        match current.record(&self.paths.signature_file()) {
            Ok(()) => {
                run.signature_recorded = true;
                tracing::info!(signature = %current, "Build signature recorded");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to record build signature"),
        }

        run
    }

    /// Pruning jobs for both archive classes, protecting what `run` created.
    pub fn prune_jobs(&self, run: &BackupRun) -> Vec<PruneJob> {
        vec![
            PruneJob {
                dir: self.paths.backup_dir.clone(),
                prefix: self.backup.database_prefix.clone(),
                keep: self.backup.keep_database,
                protect: run.database.clone(),
            },
            PruneJob {
                dir: self.paths.backup_dir.clone(),
                prefix: self.backup.config_prefix.clone(),
                keep: self.backup.keep_config,
                protect: run.config.clone(),
            },
        ]
    }
}

impl PruneJob {
    pub fn execute(&self) -> Result<retention::PruneReport> {
        retention::prune_retention(&self.dir, &self.prefix, self.keep, self.protect.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sig(seed: &str) -> BuildSignature {
        BuildSignature::compute(&[PathBuf::from(format!("/nonexistent/{seed}"))])
    }

    #[test]
    fn test_decision_table() {
        let current = sig("a");
        let other = sig("b");

        let cases = [
            (false, None, true, BackupReason::NewInstance),
            (false, Some(&current), true, BackupReason::NewInstance),
            (true, None, true, BackupReason::NoHistory),
            (true, Some(&other), true, BackupReason::ImageUpdated),
            (true, Some(&current), false, BackupReason::UpToDate),
        ];

        for (marker, last, due, reason) in cases {
            let decision = is_backup_due(marker, last, &current);
            assert_eq!(decision, BackupDecision { due, reason }, "marker={marker} last={last:?}");
        }
    }

    fn manager(root: &TempDir) -> BackupManager {
        let paths = PathsConfig {
            data_dir: root.path().join("data-root"),
            config_dir: root.path().join("config"),
            plugin_dir: root.path().join("plugins"),
            backup_dir: root.path().join("backups"),
            state_dir: root.path().to_path_buf(),
        };
        BackupManager::new(paths, BackupConfig::default())
    }

    #[test]
    fn test_run_records_signature() -> Result<()> {
        let root = TempDir::new()?;
        let manager = manager(&root);
        fs::create_dir_all(root.path().join("data-root/data"))?;
        fs::write(root.path().join("data-root/data/jellyfin.db"), b"db")?;

        let current = sig("a");
        assert!(manager.decide(&current)?.due);

        let run = manager.run(&current, Local::now());
        assert!(run.database.is_some());
        assert!(run.config.is_none());
        assert!(run.signature_recorded);

        // Marker still absent: a fresh volume stays due until the marker exists
        assert_eq!(manager.decide(&current)?.reason, BackupReason::NewInstance);
        fs::write(root.path().join(".container_initialized"), b"")?;
        assert!(!manager.decide(&current)?.due);
        Ok(())
    }

    #[test]
    fn test_archive_failure_leaves_signature_unrecorded() -> Result<()> {
        let root = TempDir::new()?;
        let manager = manager(&root);
        fs::create_dir_all(root.path().join("data-root/data"))?;
        fs::write(root.path().join("data-root/data/jellyfin.db"), b"db")?;
        // A file where the backup directory should be
        fs::write(root.path().join("backups"), b"")?;

        let run = manager.run(&sig("a"), Local::now());
        assert!(run.failed);
        assert!(!run.signature_recorded);
        assert!(!root.path().join(".last_build_signature").exists());
        Ok(())
    }

    #[test]
    fn test_prune_jobs_protect_new_archives() {
        let root = TempDir::new().unwrap();
        let manager = manager(&root);
        let run = BackupRun {
            database: Some(PathBuf::from("/b/jellyfin-db-1.zip")),
            ..BackupRun::default()
        };
        let jobs = manager.prune_jobs(&run);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].prefix, "jellyfin-db");
        assert_eq!(jobs[0].protect.as_deref(), Some(std::path::Path::new("/b/jellyfin-db-1.zip")));
        assert_eq!(jobs[1].protect, None);
    }
}
