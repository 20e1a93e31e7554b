//! Configuration management for the entrypoint.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Every field has a default so the entrypoint runs without any file at all.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::fixups::Fixup;
use crate::utils::{EntrypointError, Result};

/// Location checked when no `--config` flag is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jellyfin-entrypoint/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub signature: SignatureConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    /// Plugins baked into the image
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,

    /// Plugin repositories registered in the server configuration
    #[serde(default = "default_repositories")]
    pub repositories: Vec<RepositorySpec>,

    /// Scalar compatibility flags in the server configuration
    #[serde(default)]
    pub flags: BTreeMap<String, String>,

    #[serde(default)]
    pub sidecar: SidecarConfig,

    #[serde(default)]
    pub fixups: Vec<Fixup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Server data directory (databases live under `data/`)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Server configuration directory (holds `system.xml`)
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Plugin install root
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,

    /// Backup archive directory
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Directory holding the container marker and the last build signature
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Artifacts whose modification times identify the image build
    #[serde(default = "default_signature_artifacts")]
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Candidate database files, relative to `paths.data_dir`
    #[serde(default = "default_database_files")]
    pub database_files: Vec<PathBuf>,

    #[serde(default = "default_database_prefix")]
    pub database_prefix: String,

    #[serde(default = "default_config_prefix")]
    pub config_prefix: String,

    /// Database archives to keep
    #[serde(default = "default_keep")]
    pub keep_database: usize,

    /// Configuration archives to keep
    #[serde(default = "default_keep")]
    pub keep_config: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Environment-format file holding component versions
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

/// One declared plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginSpec {
    /// Directory name prefix (`<name>_<version>`)
    pub name: String,

    /// Desired version; falls back to the registry when absent
    #[serde(default)]
    pub version: Option<String>,

    /// Registry key holding the desired version (default `<NAME>_VERSION`)
    #[serde(default)]
    pub version_key: Option<String>,

    /// Pre-staged bundle: a directory or a `.zip`. `{version}` is substituted.
    pub source: String,

    /// File that must exist in the installed directory (the plugin assembly)
    #[serde(default)]
    pub entry_point: Option<String>,
}

impl PluginSpec {
    /// Registry key that carries this plugin's desired version.
    pub fn registry_key(&self) -> String {
        self.version_key
            .clone()
            .unwrap_or_else(|| format!("{}_VERSION", self.name.to_uppercase()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositorySpec {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_sidecar_binary")]
    pub binary: PathBuf,

    /// Loopback bind address, also used for the health check
    #[serde(default = "default_sidecar_bind")]
    pub bind: String,

    #[serde(default = "default_sidecar_data_dir")]
    pub data_dir: PathBuf,

    /// Persisted master key (mode 0600)
    #[serde(default = "default_sidecar_key_file")]
    pub key_file: PathBuf,

    #[serde(default = "default_sidecar_env")]
    pub env: String,

    #[serde(default = "default_health_attempts")]
    pub health_attempts: u32,

    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// Bounded wait for the child after SIGTERM
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Plugin disabled when the sidecar is unavailable
    #[serde(default = "default_dependent_plugin")]
    pub dependent_plugin: String,

    /// Dependent plugin's XML configuration, under `<plugin_dir>/configurations`
    #[serde(default = "default_plugin_config_file")]
    pub plugin_config_file: String,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/config")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/config/config")
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("/config/plugins")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/config/backups")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/config")
}

fn default_signature_artifacts() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/jellyfin/jellyfin"),
        PathBuf::from("/jellyfin/jellyfin-web/index.html"),
    ]
}

fn default_database_files() -> Vec<PathBuf> {
    [
        "data/jellyfin.db",
        "data/jellyfin.db-wal",
        "data/jellyfin.db-shm",
        "data/library.db",
        "data/library.db-wal",
        "data/library.db-shm",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

fn default_database_prefix() -> String {
    "jellyfin-db".to_string()
}

fn default_config_prefix() -> String {
    "jellyfin-config".to_string()
}

fn default_keep() -> usize {
    5
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/etc/environment")
}

fn default_repositories() -> Vec<RepositorySpec> {
    vec![RepositorySpec {
        name: "IAmParadox Plugins".to_string(),
        url: "https://www.iamparadox.dev/jellyfin/plugins/manifest.json".to_string(),
        enabled: true,
    }]
}

fn default_true() -> bool {
    true
}

fn default_sidecar_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/meilisearch")
}

fn default_sidecar_bind() -> String {
    "127.0.0.1:7700".to_string()
}

fn default_sidecar_data_dir() -> PathBuf {
    PathBuf::from("/config/meilisearch")
}

fn default_sidecar_key_file() -> PathBuf {
    PathBuf::from("/config/meilisearch/.master_key")
}

fn default_sidecar_env() -> String {
    "production".to_string()
}

fn default_health_attempts() -> u32 {
    30
}

fn default_health_interval_ms() -> u64 {
    1000
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_dependent_plugin() -> String {
    "Meilisearch".to_string()
}

fn default_plugin_config_file() -> String {
    "Jellyfin.Plugin.Meilisearch.xml".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            config_dir: default_config_dir(),
            plugin_dir: default_plugin_dir(),
            backup_dir: default_backup_dir(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            artifacts: default_signature_artifacts(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            database_files: default_database_files(),
            database_prefix: default_database_prefix(),
            config_prefix: default_config_prefix(),
            keep_database: default_keep(),
            keep_config: default_keep(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: default_sidecar_binary(),
            bind: default_sidecar_bind(),
            data_dir: default_sidecar_data_dir(),
            key_file: default_sidecar_key_file(),
            env: default_sidecar_env(),
            health_attempts: default_health_attempts(),
            health_interval_ms: default_health_interval_ms(),
            stop_timeout_secs: default_stop_timeout_secs(),
            dependent_plugin: default_dependent_plugin(),
            plugin_config_file: default_plugin_config_file(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log: LogConfig::default(),
            paths: PathsConfig::default(),
            signature: SignatureConfig::default(),
            backup: BackupConfig::default(),
            registry: RegistryConfig::default(),
            plugins: Vec::new(),
            repositories: default_repositories(),
            flags: BTreeMap::new(),
            sidecar: SidecarConfig::default(),
            fixups: Vec::new(),
        }
    }
}

impl PathsConfig {
    /// Sentinel marking an initialized volume.
    pub fn marker_file(&self) -> PathBuf {
        self.state_dir.join(".container_initialized")
    }

    /// Signature recorded by the last backup.
    pub fn signature_file(&self) -> PathBuf {
        self.state_dir.join(".last_build_signature")
    }

    /// The server's persisted XML configuration.
    pub fn server_config_file(&self) -> PathBuf {
        self.config_dir.join("system.xml")
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EntrypointError::io_at(path, e))?;
        toml::from_str(&content)
            .map_err(|e| EntrypointError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load from an explicit path, or from the default location when it
    /// exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(dir) = lookup("JELLYFIN_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("JELLYFIN_CONFIG_DIR") {
            self.paths.config_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("ENTRYPOINT_BACKUP_DIR") {
            self.paths.backup_dir = PathBuf::from(dir);
        }
        if let Some(keep) = lookup("ENTRYPOINT_DB_BACKUP_KEEP") {
            self.backup.keep_database = parse_override("ENTRYPOINT_DB_BACKUP_KEEP", &keep)?;
        }
        if let Some(keep) = lookup("ENTRYPOINT_CONFIG_BACKUP_KEEP") {
            self.backup.keep_config = parse_override("ENTRYPOINT_CONFIG_BACKUP_KEEP", &keep)?;
        }
        if let Some(enabled) = lookup("ENTRYPOINT_SIDECAR_ENABLED") {
            self.sidecar.enabled = matches!(
                enabled.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EntrypointError::Config(format!("{key}: invalid value '{value}'")))
}
