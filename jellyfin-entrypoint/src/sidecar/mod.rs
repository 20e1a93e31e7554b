//! Optional search-index sidecar.
//!
//! State machine:
//!
//! ```text
//! NotAttempted -> Starting -> Healthy -> Stopped
//!                         \-> Failed
//!                 Starting ----------> Stopped
//! ```
//!
//! A sidecar that cannot be brought up is never fatal: the dependent plugin
//! is disabled so the server does not rely on it, and startup carries on.

pub mod key;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::config::SidecarConfig;
use crate::patcher;
use crate::plugins::meta::{reenable_plugin, set_plugin_status, STATUS_DISABLED};
use crate::registry::VersionRegistry;
use crate::utils::{EntrypointError, Result};

/// Registry key for the version reported by the sidecar binary
pub const SIDECAR_VERSION_KEY: &str = "MEILISEARCH_VERSION";

const SMOKE_TEST_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarState {
    NotAttempted,
    Starting,
    Healthy,
    Failed { reason: String },
    Stopped,
}

impl SidecarState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(&self, next: &SidecarState) -> bool {
        use SidecarState::*;
        matches!(
            (self, next),
            (NotAttempted, Starting)
                | (Starting, Healthy)
                | (Starting, Failed { .. })
                | (Starting, Stopped)
                | (Healthy, Stopped)
        )
    }
}

impl fmt::Display for SidecarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SidecarState::NotAttempted => f.write_str("not-attempted"),
            SidecarState::Starting => f.write_str("starting"),
            SidecarState::Healthy => f.write_str("healthy"),
            SidecarState::Failed { reason } => write!(f, "failed ({reason})"),
            SidecarState::Stopped => f.write_str("stopped"),
        }
    }
}

pub struct SidecarSupervisor {
    config: SidecarConfig,
    plugin_dir: PathBuf,
    state: SidecarState,
    child: Option<Child>,
}

impl SidecarSupervisor {
    pub fn new(config: SidecarConfig, plugin_dir: PathBuf) -> Self {
        Self {
            config,
            plugin_dir,
            state: SidecarState::NotAttempted,
            child: None,
        }
    }

    pub fn state(&self) -> &SidecarState {
        &self.state
    }

    /// A live child is being supervised.
    pub fn is_running(&self) -> bool {
        self.state == SidecarState::Healthy && self.child.is_some()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.config.bind)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.config.stop_timeout_secs)
    }

    fn transition(&mut self, next: SidecarState) {
        if !self.state.can_transition(&next) {
            tracing::debug!(from = %self.state, to = %next, "Ignoring sidecar transition");
            return;
        }
        tracing::debug!(from = %self.state, to = %next, "Sidecar state change");
        self.state = next;
    }

    /// Bring the sidecar up. Always returns; failures end in `Failed` with
    /// the dependent plugin disabled.
    pub async fn start(&mut self, registry: &mut VersionRegistry) -> &SidecarState {
        if !self.config.enabled {
            tracing::info!("Search sidecar disabled, skipping");
            return &self.state;
        }

        self.transition(SidecarState::Starting);
        tracing::info!(binary = %self.config.binary.display(), bind = %self.config.bind, "Starting search sidecar");

        match self.try_start(registry).await {
            Ok(()) => {
                self.transition(SidecarState::Healthy);
                tracing::info!(url = %self.base_url(), "Search sidecar healthy");
                self.on_healthy();
            }
            Err(e) => {
                self.terminate_child().await;
                tracing::warn!(error = %e, "Search sidecar unavailable, continuing without it");
                self.transition(SidecarState::Failed {
                    reason: e.to_string(),
                });
                self.compensate();
            }
        }

        &self.state
    }

    async fn try_start(&mut self, registry: &mut VersionRegistry) -> Result<()> {
        if !self.config.binary.is_file() {
            return Err(EntrypointError::Sidecar(format!(
                "binary missing: {}",
                self.config.binary.display()
            )));
        }

        if let Some(version) = self.smoke_test().await? {
            registry.set(SIDECAR_VERSION_KEY, version);
        }

        std::fs::create_dir_all(&self.config.data_dir)
            .map_err(|e| EntrypointError::io_at(&self.config.data_dir, e))?;
        let (master_key, _) = key::load_or_create(&self.config.key_file)?;

        let child = Command::new(&self.config.binary)
            .arg("--http-addr")
            .arg(&self.config.bind)
            .arg("--db-path")
            .arg(self.config.data_dir.join("data.ms"))
            .arg("--env")
            .arg(&self.config.env)
            .arg("--master-key")
            .arg(&master_key)
            .arg("--no-analytics")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EntrypointError::Sidecar(format!("failed to spawn: {e}")))?;
        tracing::info!(pid = ?child.id(), "Search sidecar spawned");
        self.child = Some(child);

        self.wait_healthy().await?;
        self.wire_plugin(&master_key);
        Ok(())
    }

    /// Run `<binary> --version`; returns the reported version.
    async fn smoke_test(&self) -> Result<Option<String>> {
        let output = tokio::time::timeout(
            SMOKE_TEST_TIMEOUT,
            Command::new(&self.config.binary)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| EntrypointError::Sidecar("smoke test timed out".to_string()))?
        .map_err(|e| EntrypointError::Sidecar(format!("smoke test failed to run: {e}")))?;

        if !output.status.success() {
            return Err(EntrypointError::Sidecar(format!(
                "smoke test exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout.split_whitespace().last().map(str::to_string);
        tracing::info!(version = ?version, "Search sidecar smoke test passed");
        Ok(version)
    }

    /// Poll the health endpoint within the bounded window.
    async fn wait_healthy(&mut self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EntrypointError::Sidecar(format!("http client: {e}")))?;
        let url = format!("{}/health", self.base_url());
        let interval = Duration::from_millis(self.config.health_interval_ms);

        for attempt in 1..=self.config.health_attempts {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(EntrypointError::Sidecar(format!("exited prematurely with {status}")));
                }
            }

            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => tracing::debug!(attempt, status = %resp.status(), "Sidecar not ready"),
                Err(e) => tracing::debug!(attempt, error = %e, "Sidecar not reachable yet"),
            }

            tokio::time::sleep(interval).await;
        }

        Err(EntrypointError::Sidecar(format!(
            "health check timed out after {} attempts",
            self.config.health_attempts
        )))
    }

    /// Point the dependent plugin at the sidecar.
    fn wire_plugin(&self, master_key: &str) {
        let path = self
            .plugin_dir
            .join("configurations")
            .join(&self.config.plugin_config_file);
        let url = self.base_url();
        if let Err(e) = patcher::patch_values(&path, &[("Url", url.as_str()), ("ApiKey", master_key)]) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to update plugin configuration");
        }
    }

    fn on_healthy(&self) {
        match reenable_plugin(&self.plugin_dir, &self.config.dependent_plugin) {
            Ok(0) => {}
            Ok(n) => tracing::info!(plugin = %self.config.dependent_plugin, count = n, "Re-enabled dependent plugin"),
            Err(e) => tracing::warn!(plugin = %self.config.dependent_plugin, error = %e, "Failed to re-enable dependent plugin"),
        }
    }

    /// Disable the dependent plugin so the server does not expect the sidecar.
    fn compensate(&self) {
        match set_plugin_status(&self.plugin_dir, &self.config.dependent_plugin, STATUS_DISABLED) {
            Ok(n) => tracing::warn!(plugin = %self.config.dependent_plugin, count = n, "Dependent plugin disabled"),
            Err(e) => tracing::warn!(plugin = %self.config.dependent_plugin, error = %e, "Failed to disable dependent plugin"),
        }
    }

    async fn terminate_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Sidecar already gone");
            }
        }
    }

    /// Ask the child to exit without waiting for it.
    pub fn signal_terminate(&self) {
        let Some(pid) = self.child.as_ref().and_then(Child::id) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(error = %e, "Failed to signal search sidecar");
        }
    }

    /// SIGTERM the child and wait up to `timeout`, then kill it.
    pub async fn stop(&mut self, timeout: Duration) {
        if self.child.is_none() {
            return;
        }

        tracing::info!("Stopping search sidecar");
        self.signal_terminate();
        let Some(mut child) = self.child.take() else {
            return;
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => tracing::info!(%status, "Search sidecar stopped"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Error waiting for search sidecar"),
            Err(_) => {
                tracing::warn!("Search sidecar did not stop in time, killing it");
                let _ = child.kill().await;
            }
        }

        self.transition(SidecarState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::meta::{PluginMeta, STATUS_ACTIVE};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(root: &Path, binary: PathBuf, bind: String) -> SidecarConfig {
        SidecarConfig {
            enabled: true,
            binary,
            bind,
            data_dir: root.join("meilisearch"),
            key_file: root.join("meilisearch/.master_key"),
            health_attempts: 3,
            health_interval_ms: 50,
            stop_timeout_secs: 5,
            ..SidecarConfig::default()
        }
    }

    fn dependent_plugin(plugin_dir: &Path, status: &str) -> std::io::Result<PathBuf> {
        let dir = plugin_dir.join("Meilisearch_0.2.1.0");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("meta.json"), format!(r#"{{"status":"{status}"}}"#))?;
        Ok(dir)
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> std::io::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;
        // Kept apart from the data dir, which the config places at <root>/meilisearch
        let bin = dir.join("bin");
        fs::create_dir_all(&bin)?;
        let path = bin.join("meilisearch");
        fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    /// Minimal HTTP server answering 200 to everything
    async fn health_server() -> std::io::Result<String> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let body = r#"{"status":"available"}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        Ok(addr)
    }

    fn unused_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[test]
    fn test_transitions() {
        use SidecarState::*;
        let failed = Failed { reason: "x".into() };
        assert!(NotAttempted.can_transition(&Starting));
        assert!(Starting.can_transition(&Healthy));
        assert!(Starting.can_transition(&failed));
        assert!(Healthy.can_transition(&Stopped));
        assert!(!NotAttempted.can_transition(&Healthy));
        assert!(!failed.can_transition(&Stopped));
        assert!(!Stopped.can_transition(&Starting));
        assert!(!NotAttempted.can_transition(&Stopped));
    }

    #[tokio::test]
    async fn test_disabled_is_not_attempted() {
        let root = TempDir::new().unwrap();
        let mut supervisor = SidecarSupervisor::new(
            SidecarConfig::default(),
            root.path().join("plugins"),
        );
        let mut registry = VersionRegistry::empty(root.path().join("environment"));
        assert_eq!(supervisor.start(&mut registry).await, &SidecarState::NotAttempted);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_and_disables_plugin() -> Result<()> {
        let root = TempDir::new()?;
        let plugins = root.path().join("plugins");
        let plugin = dependent_plugin(&plugins, STATUS_ACTIVE)?;

        let cfg = config(root.path(), root.path().join("absent/meilisearch"), unused_addr());
        let mut supervisor = SidecarSupervisor::new(cfg, plugins);
        let mut registry = VersionRegistry::empty(root.path().join("environment"));

        let state = supervisor.start(&mut registry).await.clone();
        assert!(matches!(state, SidecarState::Failed { .. }));
        assert!(!supervisor.is_running());

        let meta = PluginMeta::load(&plugin)?.expect("meta");
        assert_eq!(meta.status(), Some(STATUS_DISABLED));
        // No key is generated for a sidecar that never ran
        assert!(!root.path().join("meilisearch/.master_key").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_smoke_test_failure() -> Result<()> {
        let root = TempDir::new()?;
        let binary = script(root.path(), "exit 2")?;
        let mut supervisor =
            SidecarSupervisor::new(config(root.path(), binary, unused_addr()), root.path().join("plugins"));
        let mut registry = VersionRegistry::empty(root.path().join("environment"));

        let state = supervisor.start(&mut registry).await.clone();
        assert!(matches!(state, SidecarState::Failed { reason } if reason.contains("smoke test")));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_premature_exit() -> Result<()> {
        let root = TempDir::new()?;
        let binary = script(
            root.path(),
            r#"if [ "$1" = "--version" ]; then echo "meilisearch 1.11.3"; exit 0; fi
exit 3"#,
        )?;
        let mut supervisor =
            SidecarSupervisor::new(config(root.path(), binary, unused_addr()), root.path().join("plugins"));
        let mut registry = VersionRegistry::empty(root.path().join("environment"));

        let state = supervisor.start(&mut registry).await.clone();
        assert!(
            matches!(&state, SidecarState::Failed { reason } if reason.contains("exited prematurely")),
            "unexpected state: {state:?}"
        );
        assert!(root.path().join("meilisearch").is_dir());
        assert_eq!(registry.get(SIDECAR_VERSION_KEY), Some("1.11.3"));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_timeout_kills_child() -> Result<()> {
        let root = TempDir::new()?;
        let binary = script(
            root.path(),
            r#"if [ "$1" = "--version" ]; then echo "meilisearch 1.11.3"; exit 0; fi
exec sleep 30"#,
        )?;
        let mut supervisor =
            SidecarSupervisor::new(config(root.path(), binary, unused_addr()), root.path().join("plugins"));
        let mut registry = VersionRegistry::empty(root.path().join("environment"));

        let state = supervisor.start(&mut registry).await.clone();
        assert!(matches!(state, SidecarState::Failed { reason } if reason.contains("timed out")));
        assert!(supervisor.child.is_none());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_healthy_then_stopped() -> Result<()> {
        let root = TempDir::new()?;
        let plugins = root.path().join("plugins");
        let plugin = dependent_plugin(&plugins, STATUS_DISABLED)?;
        fs::create_dir_all(plugins.join("configurations"))?;
        let plugin_config = plugins.join("configurations/Jellyfin.Plugin.Meilisearch.xml");
        fs::write(&plugin_config, "<PluginConfiguration><Url /></PluginConfiguration>")?;

        let binary = script(
            root.path(),
            r#"if [ "$1" = "--version" ]; then echo "meilisearch 1.11.3"; exit 0; fi
exec sleep 30"#,
        )?;
        let addr = health_server().await?;
        let mut supervisor = SidecarSupervisor::new(config(root.path(), binary, addr.clone()), plugins);
        let mut registry = VersionRegistry::empty(root.path().join("environment"));

        assert_eq!(supervisor.start(&mut registry).await, &SidecarState::Healthy);
        assert!(supervisor.is_running());

        let meta = PluginMeta::load(&plugin)?.expect("meta");
        assert_eq!(meta.status(), Some(STATUS_ACTIVE));
        let written = fs::read_to_string(&plugin_config)?;
        assert!(written.contains(&format!("http://{addr}")));

        let (key, created) = key::load_or_create(&root.path().join("meilisearch/.master_key"))?;
        assert!(!created);
        assert!(written.contains(&key));

        supervisor.stop(Duration::from_secs(5)).await;
        assert_eq!(supervisor.state(), &SidecarState::Stopped);
        assert!(!supervisor.is_running());
        Ok(())
    }
}
