//! Service configuration.
//!
//! Configuration is stored as TOML:
//! - `$KURO_SOCKETS_CONFIG` when set
//! - Linux: `~/.config/kuro/sockets.toml`
//! - Windows: `%APPDATA%/kuro/sockets.toml`
//!
//! The `PORT` environment variable overrides `server.port`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use kuro_transfer::{
    CollisionPolicy, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_TOTAL_CHUNKS, DEFAULT_MAX_TRANSFER_BYTES,
    DEFAULT_MAX_TRANSFERS_PER_CONNECTION, TransferLimits,
};
use kuro_upload_server::{ServerConfig, TransferSettings};
use serde::{Deserialize, Serialize};

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub transfer: TransferSection,
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Largest WebSocket message accepted, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Directory completed uploads are written to.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// `rename`, `overwrite` or `reject`.
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
}

/// `[transfer]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Partial transfers idle this long are dropped (0 = never).
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: usize,

    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    #[serde(default = "default_max_transfer_bytes")]
    pub max_transfer_bytes: usize,

    #[serde(default = "default_max_transfers_per_connection")]
    pub max_transfers_per_connection: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    5000
}

fn default_max_connections() -> usize {
    ServerConfig::default().max_connections
}

fn default_max_message_size() -> usize {
    ServerConfig::default().max_message_size
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_progress_interval_ms() -> u64 {
    TransferSettings::default().progress_interval.as_millis() as u64
}

fn default_stall_timeout_secs() -> u64 {
    TransferSettings::default()
        .stall_timeout
        .map_or(0, |t| t.as_secs())
}

fn default_max_total_chunks() -> usize {
    DEFAULT_MAX_TOTAL_CHUNKS
}

fn default_max_chunk_size() -> usize {
    DEFAULT_MAX_CHUNK_SIZE
}

fn default_max_transfer_bytes() -> usize {
    DEFAULT_MAX_TRANSFER_BYTES
}

fn default_max_transfers_per_connection() -> usize {
    DEFAULT_MAX_TRANSFERS_PER_CONNECTION
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            storage_dir: default_storage_dir(),
            collision_policy: CollisionPolicy::default(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            max_total_chunks: default_max_total_chunks(),
            max_chunk_size: default_max_chunk_size(),
            max_transfer_bytes: default_max_transfer_bytes(),
            max_transfers_per_connection: default_max_transfers_per_connection(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found,
    /// then applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path();
        let mut config = Self::load_from(&path)?;
        config.apply_port_override(std::env::var("PORT").ok().as_deref())?;
        Ok(config)
    }

    /// Loads `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Replaces the configured port with `value` when one is given.
    pub fn apply_port_override(&mut self, value: Option<&str>) -> anyhow::Result<()> {
        if let Some(raw) = value {
            self.server.port = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT value {raw:?}"))?;
        }
        Ok(())
    }

    /// Settings for the upload server.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            max_connections: self.server.max_connections,
            max_message_size: self.server.max_message_size,
            transfer: self.transfer.settings(),
        }
    }
}

impl TransferSection {
    fn settings(&self) -> TransferSettings {
        TransferSettings {
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            stall_timeout: (self.stall_timeout_secs > 0)
                .then(|| Duration::from_secs(self.stall_timeout_secs)),
            limits: TransferLimits {
                max_total_chunks: self.max_total_chunks,
                max_chunk_size: self.max_chunk_size,
                max_transfer_bytes: self.max_transfer_bytes,
                max_transfers_per_connection: self.max_transfers_per_connection,
            },
        }
    }
}

/// Returns the configuration file path.
fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("KURO_SOCKETS_CONFIG") {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("kuro").join("sockets.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("kuro")
            .join("sockets.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.storage_dir, PathBuf::from("uploads"));
        assert_eq!(config.server.collision_policy, CollisionPolicy::Rename);
        assert_eq!(config.transfer.progress_interval_ms, 1000);
        assert_eq!(config.transfer.stall_timeout_secs, 300);
    }

    #[test]
    fn defaults_match_library_settings() {
        let config = Config::default().server_config();
        assert_eq!(config.transfer, TransferSettings::default());
        assert_eq!(config.max_connections, ServerConfig::default().max_connections);
    }

    #[test]
    fn config_partial_toml() {
        let toml_str = r#"
            [server]
            port = 9000
            collision_policy = "reject"

            [transfer]
            stall_timeout_secs = 0
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.collision_policy, CollisionPolicy::Reject);
        assert_eq!(config.transfer.max_chunk_size, DEFAULT_MAX_CHUNK_SIZE);

        let server = config.server_config();
        assert_eq!(server.transfer.stall_timeout, None);
    }

    #[test]
    fn empty_toml_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn unknown_collision_policy_is_rejected() {
        let toml_str = "[server]\ncollision_policy = \"merge\"\n";
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn port_override() {
        let mut config = Config::default();
        config.apply_port_override(None).unwrap();
        assert_eq!(config.server.port, 5000);

        config.apply_port_override(Some("8080")).unwrap();
        assert_eq!(config.server.port, 8080);

        assert!(config.apply_port_override(Some("not-a-port")).is_err());
        assert!(config.apply_port_override(Some("70000")).is_err());
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn transfer_section_converts_units() {
        let section = TransferSection {
            progress_interval_ms: 250,
            stall_timeout_secs: 45,
            max_total_chunks: 10,
            max_chunk_size: 20,
            max_transfer_bytes: 30,
            max_transfers_per_connection: 2,
        };
        let settings = section.settings();
        assert_eq!(settings.progress_interval, Duration::from_millis(250));
        assert_eq!(settings.stall_timeout, Some(Duration::from_secs(45)));
        assert_eq!(settings.limits.max_total_chunks, 10);
        assert_eq!(settings.limits.max_chunk_size, 20);
        assert_eq!(settings.limits.max_transfer_bytes, 30);
        assert_eq!(settings.limits.max_transfers_per_connection, 2);
    }

    #[test]
    fn missing_file_is_written_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("sockets.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn config_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sockets.toml");

        let mut config = Config::default();
        config.server.storage_dir = PathBuf::from("/srv/kuro/uploads");
        config.server.collision_policy = CollisionPolicy::Overwrite;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.server.storage_dir, PathBuf::from("/srv/kuro/uploads"));
        assert_eq!(loaded.server.collision_policy, CollisionPolicy::Overwrite);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sockets.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
