//! Utility modules for the entrypoint.

pub mod errors;
pub mod logger;

pub use errors::{EntrypointError, Result};
