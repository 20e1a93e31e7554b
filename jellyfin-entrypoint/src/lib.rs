//! Jellyfin container entrypoint library
//!
//! Prepares a persistent volume before the media server starts: snapshots
//! databases and configuration when the image changed, reconciles bundled
//! plugins, patches the server configuration, optionally supervises a search
//! sidecar, then hands control to the server.

pub mod backup;
pub mod config;
pub mod daemon;
pub mod fixups;
pub mod fs;
pub mod orchestrator;
pub mod patcher;
pub mod plugins;
pub mod registry;
pub mod sidecar;
pub mod signature;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::StartupOrchestrator;
pub use utils::errors::EntrypointError;
pub type Result<T> = std::result::Result<T, EntrypointError>;
