//! SIGTERM / SIGINT handling while the entrypoint stays as the parent.
//!
//! Handlers are installed before anything is spawned, so a signal arriving
//! during startup is held until the handoff instead of killing the entrypoint
//! with a child still running.

use std::fmt;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A termination request received by the entrypoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    /// The same signal, for forwarding to a child.
    pub fn as_nix(self) -> nix::sys::signal::Signal {
        match self {
            ShutdownSignal::Interrupt => nix::sys::signal::Signal::SIGINT,
            ShutdownSignal::Terminate => nix::sys::signal::Signal::SIGTERM,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    interrupt: Signal,
    terminate: Signal,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl ShutdownCoordinator {
    /// Install the signal handlers.
    pub fn install() -> std::io::Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            shutdown_tx,
        })
    }

    /// Observe received signals from other tasks
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Forward every received signal to the returned channel from a
    /// background task.
    pub fn listen(mut self) -> broadcast::Receiver<ShutdownSignal> {
        let rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                self.wait_for_signal().await;
            }
        });
        rx
    }

    /// Wait for the next SIGTERM or SIGINT.
    pub async fn wait_for_signal(&mut self) -> ShutdownSignal {
        let received = tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        };
        info!(signal = %received, "Received termination signal");

        if let Err(e) = self.shutdown_tx.send(received) {
            debug!("No shutdown subscribers: {}", e);
        }
        received
    }
}
