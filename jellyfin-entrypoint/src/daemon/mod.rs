//! Process lifecycle after startup: handoff and signal handling.

pub mod handoff;
pub mod shutdown;

pub use handoff::{Handoff, LaunchCommand};
