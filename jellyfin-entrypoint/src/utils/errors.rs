//! Custom error types for the entrypoint.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EntrypointError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("XML parse error in {path}: {source}")]
    XmlParse {
        path: PathBuf,
        #[source]
        source: xmltree::ParseError,
    },

    #[error("XML write error: {0}")]
    XmlWrite(#[from] xmltree::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Sidecar error: {0}")]
    Sidecar(String),

    #[error("Launch error: {0}")]
    Launch(String),
}

impl EntrypointError {
    /// Attach a path to an I/O error.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EntrypointError::IoAt {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EntrypointError>;
