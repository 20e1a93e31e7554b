//! Permission handling for installed plugin trees.

use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Mode applied to every installed plugin file and directory.
pub const WORLD_READABLE_EXECUTABLE: u32 = 0o755;

/// Apply `mode` to `root` and everything below it. Symlinks are left alone.
#[cfg(unix)]
pub fn set_tree_mode(root: &Path, mode: u32) -> std::io::Result<usize> {
    use std::os::unix::fs::PermissionsExt;

    let mut touched = 0;
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.path_is_symlink() {
            continue;
        }
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))?;
        touched += 1;
    }
    Ok(touched)
}

#[cfg(not(unix))]
pub fn set_tree_mode(root: &Path, _mode: u32) -> std::io::Result<usize> {
    Ok(WalkDir::new(root).into_iter().filter_map(|e| e.ok()).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    #[cfg(unix)]
    fn test_set_tree_mode() -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new()?;
        fs::create_dir(dir.path().join("lib"))?;
        let file = dir.path().join("lib/Plugin.dll");
        fs::write(&file, b"dll")?;
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600))?;

        let touched = set_tree_mode(dir.path(), WORLD_READABLE_EXECUTABLE)?;

        assert_eq!(touched, 3);
        assert_eq!(fs::metadata(&file)?.permissions().mode() & 0o777, 0o755);
        Ok(())
    }
}
