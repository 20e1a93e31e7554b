//! Archive retention: keep the newest N archives of one class.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::utils::{EntrypointError, Result};

/// Outcome of one pruning pass
#[derive(Debug, Default)]
pub struct PruneReport {
    pub kept: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

/// True for `<prefix>-YYYYmmdd-HHMMSS[-N].zip`. The timestamp layout keeps
/// classes apart when one prefix extends another (`jellyfin`, `jellyfin-config`);
/// hidden partial files never match.
fn matches_class(file_name: &str, prefix: &str) -> bool {
    file_name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|rest| rest.strip_suffix(".zip"))
        .is_some_and(is_archive_stamp)
}

fn is_archive_stamp(stamp: &str) -> bool {
    let digits = |s: &str, len: Option<usize>| {
        !s.is_empty() && len.map_or(true, |n| s.len() == n) && s.bytes().all(|b| b.is_ascii_digit())
    };

    let mut parts = stamp.split('-');
    let (Some(date), Some(time)) = (parts.next(), parts.next()) else {
        return false;
    };
    let sequence_ok = parts.next().map_or(true, |n| digits(n, None));
    digits(date, Some(8)) && digits(time, Some(6)) && sequence_ok && parts.next().is_none()
}

/// Delete all but the `keep` most recently modified archives of `prefix`.
///
/// `keep` is clamped to at least 1 and `protect` (the archive just created)
/// is always retained and counts toward `keep`.
pub fn prune_retention(
    dir: &Path,
    prefix: &str,
    keep: usize,
    protect: Option<&Path>,
) -> Result<PruneReport> {
    let keep = keep.max(1);
    let mut report = PruneReport::default();

    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(EntrypointError::io_at(dir, e)),
    };

    let mut archives: Vec<(SystemTime, PathBuf)> = read_dir
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| matches_class(&e.file_name().to_string_lossy(), prefix))
        .map(|e| {
            let modified = e
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, e.path())
        })
        .collect();

    // Newest first; names embed the timestamp so they break mtime ties
    archives.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    let protect = protect.map(Path::to_path_buf);
    if let Some(protected) = &protect {
        if let Some(pos) = archives.iter().position(|(_, p)| p == protected) {
            let entry = archives.remove(pos);
            archives.insert(0, entry);
        }
    }

    for (index, (_, path)) in archives.into_iter().enumerate() {
        if index < keep || protect.as_ref() == Some(&path) {
            report.kept.push(path);
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(archive = %path.display(), "Removed old backup");
                report.deleted.push(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(archive = %path.display(), error = %e, "Failed to remove old backup");
            }
        }
    }

    Ok(report)
}
