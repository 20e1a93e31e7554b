//! Pre-staged plugin bundles: a directory tree or a `.zip` release archive.

use std::fs::{self, File};
use std::path::Path;

use crate::fs::walker::copy_dir_recursive;
use crate::utils::{EntrypointError, Result};

/// Materialize `source` into `dest`. Returns the number of files written.
pub fn stage_bundle(source: &Path, dest: &Path) -> Result<u64> {
    if source.is_dir() {
        return copy_dir_recursive(source, dest).map_err(|e| EntrypointError::io_at(source, e));
    }

    let is_zip = source
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
    if source.is_file() && is_zip {
        return extract_zip(source, dest);
    }

    Err(EntrypointError::Plugin(format!(
        "unsupported bundle (expected directory or .zip): {}",
        source.display()
    )))
}

/// Extract a zip archive into the destination directory.
/// Entries escaping `dest` are skipped.
fn extract_zip(archive_path: &Path, dest: &Path) -> Result<u64> {
    let file = File::open(archive_path).map_err(|e| EntrypointError::io_at(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file)?;
    fs::create_dir_all(dest).map_err(|e| EntrypointError::io_at(dest, e))?;

    let mut written = 0u64;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            tracing::warn!(entry = %entry.name(), "Skipping unsafe path in plugin archive");
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| EntrypointError::io_at(&out_path, e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| EntrypointError::io_at(parent, e))?;
        }
        let mut out_file =
            File::create(&out_path).map_err(|e| EntrypointError::io_at(&out_path, e))?;
        std::io::copy(&mut entry, &mut out_file).map_err(|e| EntrypointError::io_at(&out_path, e))?;
        written += 1;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    #[test]
    fn test_stage_directory() -> Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        fs::write(src.path().join("Plugin.dll"), b"dll")?;

        let written = stage_bundle(src.path(), &dst.path().join("stage"))?;
        assert_eq!(written, 1);
        assert!(dst.path().join("stage/Plugin.dll").is_file());
        Ok(())
    }

    #[test]
    fn test_stage_zip() -> Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        let archive_path = src.path().join("CustomTabs_1.0.0.0.zip");

        let mut zip = zip::ZipWriter::new(File::create(&archive_path)?);
        zip.start_file("Jellyfin.Plugin.CustomTabs.dll", SimpleFileOptions::default())?;
        zip.write_all(b"dll")?;
        zip.add_directory("lang/", SimpleFileOptions::default())?;
        zip.start_file("lang/en.json", SimpleFileOptions::default())?;
        zip.write_all(b"{}")?;
        zip.finish()?;

        let stage = dst.path().join("stage");
        assert_eq!(stage_bundle(&archive_path, &stage)?, 2);
        assert_eq!(fs::read(stage.join("Jellyfin.Plugin.CustomTabs.dll"))?, b"dll");
        assert!(stage.join("lang/en.json").is_file());
        Ok(())
    }

    #[test]
    fn test_unsupported_bundle() -> Result<()> {
        let src = TempDir::new()?;
        let tarball = src.path().join("plugin.tar");
        fs::write(&tarball, b"")?;
        assert!(stage_bundle(&tarball, &src.path().join("stage")).is_err());
        assert!(stage_bundle(&src.path().join("missing"), &src.path().join("stage")).is_err());
        Ok(())
    }
}
