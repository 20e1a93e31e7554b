//! Small idempotent filesystem patches applied before the server starts.
//!
//! ```toml
//! [[fixups]]
//! kind = "ensure_dir"
//! path = "/config/cache/transcodes"
//! mode = 0o755
//!
//! [[fixups]]
//! kind = "symlink"
//! link = "/jellyfin/jellyfin-web/custom.css"
//! target = "/config/branding/custom.css"
//!
//! [[fixups]]
//! kind = "replace_text"
//! file = "/jellyfin/jellyfin-web/index.html"
//! find = "<head>"
//! replace = "<head><meta name=\"robots\" content=\"noindex\">"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;

use crate::fs::write_atomic;
use crate::utils::{EntrypointError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fixup {
    EnsureDir {
        path: PathBuf,
        #[serde(default)]
        mode: Option<u32>,
    },
    Symlink {
        link: PathBuf,
        target: PathBuf,
    },
    ReplaceText {
        file: PathBuf,
        find: String,
        replace: String,
    },
}

impl fmt::Display for Fixup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fixup::EnsureDir { path, .. } => write!(f, "ensure_dir {}", path.display()),
            Fixup::Symlink { link, target } => {
                write!(f, "symlink {} -> {}", link.display(), target.display())
            }
            Fixup::ReplaceText { file, .. } => write!(f, "replace_text {}", file.display()),
        }
    }
}

impl Fixup {
    /// Apply once. Returns whether anything on disk changed.
    pub fn apply(&self) -> Result<bool> {
        match self {
            Fixup::EnsureDir { path, mode } => ensure_dir(path, *mode),
            Fixup::Symlink { link, target } => ensure_symlink(link, target),
            Fixup::ReplaceText {
                file,
                find,
                replace,
            } => replace_text(file, find, replace),
        }
    }
}

fn ensure_dir(path: &Path, mode: Option<u32>) -> Result<bool> {
    let created = !path.is_dir();
    if created {
        fs::create_dir_all(path).map_err(|e| EntrypointError::io_at(path, e))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = mode {
            let current = fs::metadata(path)
                .map_err(|e| EntrypointError::io_at(path, e))?
                .permissions()
                .mode()
                & 0o7777;
            if current != mode {
                fs::set_permissions(path, fs::Permissions::from_mode(mode))
                    .map_err(|e| EntrypointError::io_at(path, e))?;
                return Ok(true);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(created)
}

#[cfg(unix)]
fn ensure_symlink(link: &Path, target: &Path) -> Result<bool> {
    match fs::read_link(link) {
        Ok(existing) if existing == target => return Ok(false),
        Ok(_) => fs::remove_file(link).map_err(|e| EntrypointError::io_at(link, e))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(_) => {
            // A regular file or directory occupies the path
            return Err(EntrypointError::Config(format!(
                "{} exists and is not a symlink",
                link.display()
            )));
        }
    }

    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).map_err(|e| EntrypointError::io_at(parent, e))?;
    }
    std::os::unix::fs::symlink(target, link).map_err(|e| EntrypointError::io_at(link, e))?;
    Ok(true)
}

#[cfg(not(unix))]
fn ensure_symlink(link: &Path, _target: &Path) -> Result<bool> {
    Err(EntrypointError::Config(format!(
        "symlinks unsupported on this platform: {}",
        link.display()
    )))
}

fn replace_text(file: &Path, find: &str, replace: &str) -> Result<bool> {
    if find.is_empty() {
        return Err(EntrypointError::Config(format!(
            "{}: empty search text",
            file.display()
        )));
    }

    let content = fs::read_to_string(file).map_err(|e| EntrypointError::io_at(file, e))?;
    if !content.contains(find) {
        return Ok(false);
    }
    // Already applied when the replacement embeds the search text
    if replace.contains(find) && content.contains(replace) {
        return Ok(false);
    }

    let patched = content.replace(find, replace);
    write_atomic(file, patched.as_bytes()).map_err(|e| EntrypointError::io_at(file, e))?;
    Ok(true)
}

/// Apply every fixup concurrently on the blocking pool.
/// Failures are logged; returns how many fixups failed.
pub async fn run_fixups(fixups: Vec<Fixup>) -> usize {
    if fixups.is_empty() {
        return 0;
    }

    let mut tasks = JoinSet::new();
    for fixup in fixups {
        tasks.spawn_blocking(move || {
            let result = fixup.apply();
            (fixup, result)
        });
    }

    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((fixup, Ok(true))) => tracing::info!(fixup = %fixup, "Fixup applied"),
            Ok((fixup, Ok(false))) => tracing::debug!(fixup = %fixup, "Fixup already in place"),
            Ok((fixup, Err(e))) => {
                tracing::warn!(fixup = %fixup, error = %e, "Fixup failed");
                failed += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Fixup task panicked");
                failed += 1;
            }
        }
    }
    failed
}
