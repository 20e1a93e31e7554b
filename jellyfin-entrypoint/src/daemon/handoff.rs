//! Handing control to the media server.
//!
//! Without a sidecar the entrypoint replaces itself with the server process.
//! With a healthy sidecar it stays as the parent so the sidecar can be
//! stopped once the server exits.
//!
//! A termination request reaches both children at once. The server then has
//! the sidecar's stop timeout to exit before it is killed.

use std::ffi::OsString;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::{sleep_until, Instant};

use super::shutdown::ShutdownSignal;
use crate::sidecar::SidecarSupervisor;
use crate::utils::{EntrypointError, Result};

/// The server command line, with the program resolved on `PATH`.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    program: PathBuf,
    arg0: OsString,
    args: Vec<OsString>,
}

impl LaunchCommand {
    /// Validate the command. Empty input or an unresolvable program is fatal.
    pub fn resolve(argv: Vec<OsString>) -> Result<Self> {
        let mut argv = argv.into_iter();
        let arg0 = argv
            .next()
            .ok_or_else(|| EntrypointError::Launch("no launch command given".to_string()))?;
        let program = which::which(&arg0).map_err(|e| {
            EntrypointError::Launch(format!("{} not found: {}", arg0.to_string_lossy(), e))
        })?;
        Ok(Self {
            program,
            arg0,
            args: argv.collect(),
        })
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    fn std_command(&self) -> std::process::Command {
        let mut command = std::process::Command::new(&self.program);
        command.arg0(&self.arg0).args(&self.args);
        command
    }
}

impl std::fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How startup ends
pub enum Handoff {
    /// Replace the entrypoint with the server
    Exec(LaunchCommand),
    /// Run the server as a child and stop the sidecar after it exits
    Supervise {
        command: LaunchCommand,
        sidecar: SidecarSupervisor,
    },
}

impl Handoff {
    pub fn command(&self) -> &LaunchCommand {
        match self {
            Handoff::Exec(command) => command,
            Handoff::Supervise { command, .. } => command,
        }
    }

    /// Perform the handoff. Returns the exit code to leave with; an exec
    /// that succeeds never returns. A signal received during startup ends
    /// here without launching the server.
    pub async fn run(self, mut signals: broadcast::Receiver<ShutdownSignal>) -> Result<i32> {
        match self {
            Handoff::Exec(command) => match pending_signal(&mut signals) {
                Some(received) => {
                    tracing::info!(signal = %received, "Termination requested before launch");
                    Ok(signal_exit_code(received))
                }
                None => Err(exec(&command)),
            },
            Handoff::Supervise { command, sidecar } => supervise(&command, sidecar, signals).await,
        }
    }
}

fn pending_signal(signals: &mut broadcast::Receiver<ShutdownSignal>) -> Option<ShutdownSignal> {
    loop {
        match signals.try_recv() {
            Ok(received) => return Some(received),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
        }
    }
}

fn signal_exit_code(received: ShutdownSignal) -> i32 {
    128 + received.as_nix() as i32
}

/// Replace the current process image. Only returns on failure.
pub fn exec(command: &LaunchCommand) -> EntrypointError {
    let err = command.std_command().exec();
    EntrypointError::Launch(format!("exec {} failed: {}", command.program.display(), err))
}

/// Run the server as a child, forwarding termination signals, then stop the
/// sidecar. Returns the server's exit code.
pub async fn supervise(
    command: &LaunchCommand,
    mut sidecar: SidecarSupervisor,
    mut signals: broadcast::Receiver<ShutdownSignal>,
) -> Result<i32> {
    let grace = sidecar.stop_timeout();

    if let Some(received) = pending_signal(&mut signals) {
        tracing::info!(signal = %received, "Termination requested before launch");
        sidecar.stop(grace).await;
        return Ok(signal_exit_code(received));
    }

    let spawned = tokio::process::Command::from(command.std_command())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            sidecar.stop(grace).await;
            return Err(EntrypointError::Launch(format!(
                "failed to start {}: {}",
                command.program.display(),
                e
            )));
        }
    };
    let pid = child.id();
    tracing::info!(pid = ?pid, "Server running under supervision");

    // Set by the first termination request
    let mut deadline: Option<Instant> = None;
    let mut killed = false;
    let mut listening = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            received = signals.recv(), if listening => match received {
                Ok(received) => {
                    if let Some(pid) = pid {
                        tracing::info!(signal = %received, pid, "Forwarding signal to server");
                        if let Err(e) = kill(Pid::from_raw(pid as i32), received.as_nix()) {
                            tracing::warn!(error = %e, "Failed to forward signal");
                        }
                    }
                    if deadline.is_none() {
                        sidecar.signal_terminate();
                        deadline = Some(Instant::now() + grace);
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => listening = false,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !killed => {
                tracing::warn!(grace = ?grace, "Server did not exit in time, killing it");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "Failed to kill server");
                }
                killed = true;
            }
        }
    };

    tracing::info!(%status, "Server exited");
    // The sidecar was already asked to stop when the request came in
    let remaining = deadline.map_or(grace, |d| d.saturating_duration_since(Instant::now()));
    sidecar.stop(remaining).await;
    Ok(exit_code(status))
}

/// Shell convention: the exit code, or 128 + signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}
