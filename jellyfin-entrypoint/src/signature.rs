//! Build signature: identifies the image the container was started from.
//!
//! Derived from the modification timestamps of fixed application artifacts,
//! so it stays stable across restarts and changes on every rebuild.

use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::fs::write_atomic;
use crate::utils::{EntrypointError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSignature(String);

impl BuildSignature {
    /// Compute the signature over `artifacts` in order.
    pub fn compute(artifacts: &[PathBuf]) -> Self {
        let mut hasher = Sha256::new();
        for artifact in artifacts {
            hasher.update(artifact.to_string_lossy().as_bytes());
            hasher.update(b":");
            match modified_token(artifact) {
                Some(token) => hasher.update(token.as_bytes()),
                None => {
                    tracing::warn!(artifact = %artifact.display(), "Signature artifact missing");
                    hasher.update(b"missing");
                }
            }
            hasher.update(b"\n");
        }
        BuildSignature(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the recorded signature. Missing or blank file → None.
    pub fn read_recorded(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let trimmed = content.trim();
                Ok((!trimmed.is_empty()).then(|| BuildSignature(trimmed.to_string())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EntrypointError::io_at(path, e)),
        }
    }

    /// Persist as the last backed-up signature.
    pub fn record(&self, path: &Path) -> Result<()> {
        write_atomic(path, format!("{}\n", self.0).as_bytes())
            .map_err(|e| EntrypointError::io_at(path, e))
    }
}

impl fmt::Display for BuildSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for log lines
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

fn modified_token(path: &Path) -> Option<String> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
    Some(format!("{}.{:09}", since_epoch.as_secs(), since_epoch.subsec_nanos()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn touch(path: &Path, secs: u64) -> std::io::Result<()> {
        let file = fs::OpenOptions::new().create(true).write(true).open(path)?;
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }

    #[test]
    fn test_stable_for_unchanged_artifacts() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let binary = dir.path().join("jellyfin");
        let web = dir.path().join("index.html");
        touch(&binary, 1_700_000_000)?;
        touch(&web, 1_700_000_100)?;

        let artifacts = vec![binary, web];
        assert_eq!(BuildSignature::compute(&artifacts), BuildSignature::compute(&artifacts));
        Ok(())
    }

    #[test]
    fn test_changes_when_artifact_rebuilt() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let binary = dir.path().join("jellyfin");
        let web = dir.path().join("index.html");
        touch(&binary, 1_700_000_000)?;
        touch(&web, 1_700_000_100)?;
        let artifacts = vec![binary.clone(), web];

        let before = BuildSignature::compute(&artifacts);
        touch(&binary, 1_800_000_000)?;
        assert_ne!(before, BuildSignature::compute(&artifacts));
        Ok(())
    }

    #[test]
    fn test_missing_artifact_still_signs() {
        let artifacts = vec![PathBuf::from("/nonexistent/jellyfin")];
        let sig = BuildSignature::compute(&artifacts);
        assert_eq!(sig.as_str().len(), 64);
    }

    #[test]
    fn test_record_and_read() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(".last_build_signature");
        assert_eq!(BuildSignature::read_recorded(&path)?, None);

        let sig = BuildSignature::compute(&[PathBuf::from("/nonexistent")]);
        sig.record(&path)?;
        assert_eq!(BuildSignature::read_recorded(&path)?, Some(sig));

        fs::write(&path, "  \n")?;
        assert_eq!(BuildSignature::read_recorded(&path)?, None);
        Ok(())
    }
}
