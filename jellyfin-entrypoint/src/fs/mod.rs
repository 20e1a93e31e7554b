//! File system helpers shared by the startup components.

pub mod atomic;
pub mod permissions;
pub mod walker;

pub use atomic::{write_atomic, write_atomic_with_mode};
