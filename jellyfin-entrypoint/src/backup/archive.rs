//! Timestamped zip snapshots of database files and the configuration tree.

use chrono::{DateTime, TimeZone};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::fs::walker::{walk_files, WalkOptions};
use crate::utils::{EntrypointError, Result};

/// Timestamp layout embedded in archive names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// `<prefix>-<timestamp>.zip`
pub fn archive_name<Tz: TimeZone>(prefix: &str, timestamp: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}-{}.zip", prefix, timestamp.format(TIMESTAMP_FORMAT))
}

/// Archive the candidates (relative to `data_dir`) that exist.
///
/// Returns `Ok(None)` when none of them exist.
pub fn backup_database<Tz: TimeZone>(
    data_dir: &Path,
    candidates: &[PathBuf],
    dest_dir: &Path,
    prefix: &str,
    timestamp: &DateTime<Tz>,
) -> Result<Option<PathBuf>>
where
    Tz::Offset: std::fmt::Display,
{
    let entries: Vec<(PathBuf, String)> = candidates
        .iter()
        .map(|rel| (data_dir.join(rel), entry_name(rel)))
        .filter(|(path, _)| path.is_file())
        .collect();

    if entries.is_empty() {
        tracing::info!(data_dir = %data_dir.display(), "No database files present, nothing to back up");
        return Ok(None);
    }

    let archive = create_archive(dest_dir, &archive_name(prefix, timestamp), &entries)?;
    Ok(Some(archive))
}

/// Archive the whole configuration tree when it holds at least one file.
pub fn backup_config<Tz: TimeZone>(
    config_dir: &Path,
    dest_dir: &Path,
    prefix: &str,
    timestamp: &DateTime<Tz>,
) -> Result<Option<PathBuf>>
where
    Tz::Offset: std::fmt::Display,
{
    if !config_dir.is_dir() {
        tracing::info!(config_dir = %config_dir.display(), "Configuration directory absent, nothing to back up");
        return Ok(None);
    }

    // Half-written siblings of atomic writes in progress
    let options = WalkOptions {
        exclude_patterns: vec![".tmp-".to_string()],
        ..WalkOptions::default()
    };
    let files = walk_files(config_dir, &options)
        .map_err(|e| EntrypointError::io_at(config_dir, e))?;
    if files.is_empty() {
        tracing::info!(config_dir = %config_dir.display(), "Configuration directory empty, nothing to back up");
        return Ok(None);
    }

    let entries: Vec<(PathBuf, String)> = files
        .into_iter()
        .map(|f| {
            let name = entry_name(&f.relative_path);
            (f.path, name)
        })
        .collect();

    let archive = create_archive(dest_dir, &archive_name(prefix, timestamp), &entries)?;
    Ok(Some(archive))
}

/// Write `entries` into `dest_dir/name` at the fastest deflate level.
///
/// The archive is assembled under a hidden partial name and renamed into
/// place, so a crash never leaves a truncated archive matching the prune glob.
pub fn create_archive(dest_dir: &Path, name: &str, entries: &[(PathBuf, String)]) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir).map_err(|e| EntrypointError::io_at(dest_dir, e))?;

    let target = unique_path(dest_dir, name);
    let partial = dest_dir.join(format!(
        ".{}.partial",
        target.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
    ));

    let result = write_zip(&partial, entries).and_then(|()| {
        fs::rename(&partial, &target).map_err(|e| EntrypointError::io_at(&target, e))
    });

    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    tracing::info!(archive = %target.display(), files = entries.len(), "Backup archive created");
    Ok(target)
}

fn write_zip(path: &Path, entries: &[(PathBuf, String)]) -> Result<()> {
    let file = File::create(path).map_err(|e| EntrypointError::io_at(path, e))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(1))
        .unix_permissions(0o644);

    for (source, name) in entries {
        zip.start_file(name.as_str(), options)?;
        let mut input = File::open(source).map_err(|e| EntrypointError::io_at(source, e))?;
        std::io::copy(&mut input, &mut zip).map_err(|e| EntrypointError::io_at(source, e))?;
    }

    let file = zip.finish()?;
    file.sync_all()?;
    Ok(())
}

/// Archive member name: relative path with forward slashes.
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Two starts within one second would collide; suffix the later one.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = name.trim_end_matches(".zip");
    (1..)
        .map(|n| dir.join(format!("{stem}-{n}.zip")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn member_names(path: &Path) -> Vec<String> {
        let file = File::open(path).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_archive_name() {
        assert_eq!(archive_name("jellyfin-db", &fixed_time()), "jellyfin-db-20261017-083000.zip");
    }

    #[test]
    fn test_backup_database_only_existing_candidates() -> Result<()> {
        let data = TempDir::new()?;
        let dest = TempDir::new()?;
        fs::create_dir(data.path().join("data"))?;
        fs::write(data.path().join("data/jellyfin.db"), b"main")?;
        fs::write(data.path().join("data/library.db"), b"library")?;

        let candidates: Vec<PathBuf> = ["data/jellyfin.db", "data/jellyfin.db-wal", "data/library.db"]
            .iter()
            .map(PathBuf::from)
            .collect();

        let archive = backup_database(data.path(), &candidates, dest.path(), "jellyfin-db", &fixed_time())?
            .expect("archive created");

        assert_eq!(member_names(&archive), vec!["data/jellyfin.db", "data/library.db"]);
        Ok(())
    }

    #[test]
    fn test_backup_database_nothing_present() -> Result<()> {
        let data = TempDir::new()?;
        let dest = TempDir::new()?;
        let candidates = vec![PathBuf::from("data/jellyfin.db")];

        let archive = backup_database(data.path(), &candidates, dest.path(), "jellyfin-db", &fixed_time())?;
        assert!(archive.is_none());
        assert_eq!(fs::read_dir(dest.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_backup_config_tree() -> Result<()> {
        let config = TempDir::new()?;
        let dest = TempDir::new()?;
        fs::create_dir(config.path().join("users"))?;
        fs::write(config.path().join("system.xml"), b"<ServerConfiguration/>")?;
        fs::write(config.path().join("users/a.xml"), b"<User/>")?;
        fs::write(config.path().join(".system.xml.tmp-4242"), b"<Server")?;

        let archive = backup_config(config.path(), dest.path(), "jellyfin-config", &fixed_time())?
            .expect("archive created");
        assert_eq!(member_names(&archive), vec!["system.xml", "users/a.xml"]);
        Ok(())
    }

    #[test]
    fn test_backup_config_empty_tree_skipped() -> Result<()> {
        let config = TempDir::new()?;
        let dest = TempDir::new()?;
        fs::create_dir(config.path().join("users"))?;

        assert!(backup_config(config.path(), dest.path(), "jellyfin-config", &fixed_time())?.is_none());
        assert!(backup_config(&config.path().join("absent"), dest.path(), "jellyfin-config", &fixed_time())?.is_none());
        Ok(())
    }

    #[test]
    fn test_same_second_does_not_overwrite() -> Result<()> {
        let src = TempDir::new()?;
        let dest = TempDir::new()?;
        let file = src.path().join("jellyfin.db");
        fs::write(&file, b"db")?;
        let entries = vec![(file, "jellyfin.db".to_string())];

        let first = create_archive(dest.path(), "jellyfin-db-20261017-083000.zip", &entries)?;
        let second = create_archive(dest.path(), "jellyfin-db-20261017-083000.zip", &entries)?;

        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("jellyfin-db-20261017-083000-1.zip"));
        Ok(())
    }
}
