//! Sidecar master key: generated once, persisted with owner-only permissions.

use std::path::Path;
use uuid::Uuid;

use crate::fs::write_atomic_with_mode;
use crate::utils::{EntrypointError, Result};

const KEY_FILE_MODE: u32 = 0o600;

/// Minimum length the search engine accepts for a production master key
pub const MIN_KEY_LEN: usize = 16;

/// 64 hex characters from two random UUIDs.
pub fn generate_key() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Reuse the persisted key, or generate and persist a fresh one.
///
/// Returns the key and whether it was newly generated. A key file that is
/// empty or too short counts as absent.
pub fn load_or_create(path: &Path) -> Result<(String, bool)> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let key = content.trim();
            if key.len() >= MIN_KEY_LEN {
                return Ok((key.to_string(), false));
            }
            tracing::warn!(path = %path.display(), "Sidecar key file unusable, generating a new key");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(EntrypointError::io_at(path, e)),
    }

    let key = generate_key();
    write_atomic_with_mode(path, format!("{key}\n").as_bytes(), KEY_FILE_MODE)
        .map_err(|e| EntrypointError::io_at(path, e))?;
    tracing::info!(path = %path.display(), "Generated new sidecar master key");
    Ok((key, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_key_shape() {
        let key = generate_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_key_persisted_and_reused() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("meilisearch/.master_key");

        let (first, created) = load_or_create(&path)?;
        assert!(created);
        let (second, created) = load_or_create(&path)?;
        assert!(!created);
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path)?.permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
        Ok(())
    }

    #[test]
    fn test_short_key_replaced() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(".master_key");
        std::fs::write(&path, "short\n")?;

        let (key, created) = load_or_create(&path)?;
        assert!(created);
        assert_eq!(key.len(), 64);
        Ok(())
    }
}
