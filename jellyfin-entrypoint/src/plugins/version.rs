//! Plugin versions: dot-separated numeric segments.
//!
//! Plugin releases carry four segments (`10.11.0.1`), so these are compared
//! segment-wise with missing trailing segments read as zero. When the padded
//! values tie, the version with more segments is greater (`1.2.0 > 1.2`).

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::utils::EntrypointError;

/// Equality and hashing follow the parsed segments, so `01.2 == 1.2`.
#[derive(Debug, Clone)]
pub struct PluginVersion {
    segments: Vec<u64>,
    raw: String,
}

impl PluginVersion {
    /// The version as written (leading `v` stripped).
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for PluginVersion {
    type Err = EntrypointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let raw = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        if raw.is_empty() {
            return Err(EntrypointError::InvalidVersion(s.to_string()));
        }

        let segments = raw
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| EntrypointError::InvalidVersion(s.to_string()))?;

        Ok(PluginVersion {
            segments,
            raw: raw.to_string(),
        })
    }
}

impl PartialEq for PluginVersion {
    fn eq(&self, other: &Self) -> bool {
        self.segments == other.segments
    }
}

impl Eq for PluginVersion {}

impl Hash for PluginVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.segments.hash(state);
    }
}

impl Ord for PluginVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.segments.len().cmp(&other.segments.len())
    }
}

impl PartialOrd for PluginVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
