//! Configuration system for nfspoof
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/com.nfspoof.nfspoof/config.toml
//! - Linux: ~/.config/nfspoof/config.toml
//!
//! Command-line flags of the mount binary override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::credential::{Credential, DEFAULT_MAX_AUX_GIDS};
use crate::rpc::MAX_AUTH_UNIX_GIDS;
use crate::types::NfsVersion;
use crate::{DEFAULT_MAX_READ, DEFAULT_MAX_WRITE};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote server and export
    pub server: ServerConfig,
    /// Spoofed AUTH_UNIX identity
    pub identity: IdentityConfig,
    /// Handle/attribute cache settings
    pub cache: CacheConfig,
    /// Network settings
    pub network: NetworkConfig,
    /// Local mount settings
    pub mount: MountConfig,
    /// READ/WRITE sizing
    pub transfer: TransferConfig,
}

/// Transport used for every RPC program
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
}

/// Remote server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host name or address
    pub host: String,
    /// Exported directory to mount
    pub export: String,
    /// MOUNT program port (portmapper lookup if None)
    pub mount_port: Option<u16>,
    /// NFS program port (portmapper lookup if None)
    pub nfs_port: Option<u16>,
    /// Portmapper port
    pub portmap_port: u16,
    pub transport: TransportKind,
    /// Pin the NFS version (2 or 3); otherwise v3 is tried first
    pub nfs_version: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            export: "/".into(),
            mount_port: None,
            nfs_port: None,
            portmap_port: 111,
            transport: TransportKind::Tcp,
            nfs_version: None,
        }
    }
}

/// Identity presented in the AUTH_UNIX credential
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub uid: u32,
    pub gid: u32,
    /// Supplementary groups (truncated to `max_aux_gids`)
    pub gids: Vec<u32>,
    /// AUTH_UNIX machine name (local host name if None)
    pub machine_name: Option<String>,
    /// Act as the owner of each object touched
    pub impersonate_owner: bool,
    pub max_aux_gids: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            gids: Vec::new(),
            machine_name: None,
            impersonate_owner: false,
            max_aux_gids: DEFAULT_MAX_AUX_GIDS,
        }
    }
}

impl IdentityConfig {
    pub fn credential(&self) -> Credential {
        Credential::new(self.uid, self.gid, self.gids.clone())
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long cached attributes are trusted (milliseconds)
    pub attr_ttl_ms: u64,
    /// Maximum number of cached paths
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            attr_ttl_ms: 1000,
            max_entries: 1024,
        }
    }
}

impl CacheConfig {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
    /// Bind a source port below 1024 (needs root)
    pub reserved_port: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            reserved_port: true,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Local mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Default mount point (optional)
    pub mount_point: Option<PathBuf>,
    /// Unmount from the server right after obtaining the root handle
    pub hide: bool,
    /// Hex root handle; skips MNT entirely
    pub root_handle: Option<String>,
    /// Walk `..` above the export root after mounting
    pub getroot: bool,
    /// Reject every mutating callback with EROFS
    pub read_only: bool,
    /// Pass `allow_other` to FUSE
    pub allow_other: bool,
}

/// READ/WRITE sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Upper bound for a single READ (lowered to the server's rtmax)
    pub max_read: u32,
    /// Upper bound for a single WRITE (lowered to the server's wtmax)
    pub max_write: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_read: DEFAULT_MAX_READ,
            max_write: DEFAULT_MAX_WRITE,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<(), ConfigError> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(ConfigError::NoConfigDir),
        }
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "nfspoof", "nfspoof")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Pinned NFS version, if any
    pub fn nfs_version(&self) -> Result<Option<NfsVersion>, ConfigError> {
        match self.server.nfs_version {
            None => Ok(None),
            Some(n) => NfsVersion::from_number(n)
                .map(Some)
                .ok_or_else(|| ConfigError::Invalid(format!("unsupported NFS version {}", n))),
        }
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.nfs_version()?;
        if self.transfer.max_read == 0 || self.transfer.max_write == 0 {
            return Err(ConfigError::Invalid(
                "transfer sizes must be non-zero".into(),
            ));
        }
        if self.identity.max_aux_gids > MAX_AUTH_UNIX_GIDS {
            return Err(ConfigError::Invalid(format!(
                "identity.max_aux_gids must be at most {}",
                MAX_AUTH_UNIX_GIDS
            )));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid("cache.max_entries must be non-zero".into()));
        }
        if let Some(handle) = &self.mount.root_handle {
            crate::types::FileHandle::from_hex(handle)
                .map_err(|e| ConfigError::Invalid(format!("mount.root_handle: {}", e)))?;
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("No configuration directory available")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.identity.uid, 0);
        assert_eq!(config.identity.max_aux_gids, 16);
        assert_eq!(config.cache.attr_ttl_ms, 1000);
        assert_eq!(config.server.transport, TransportKind::Tcp);
        assert!(!config.mount.hide);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.server.host = "filer.example".into();
        config.identity.gids = vec![4, 24, 27];
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.server.host, "filer.example");
        assert_eq!(parsed.identity.gids, vec![4, 24, 27]);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [server]
            host = "10.0.0.5"
            export = "/data"
            transport = "udp"

            [identity]
            uid = 1000
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.export, "/data");
        assert_eq!(config.server.transport, TransportKind::Udp);
        assert_eq!(config.identity.uid, 1000);
        // Other values should be defaults
        assert_eq!(config.identity.gid, 0);
        assert_eq!(config.network.request_timeout_secs, 30);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[server]"));
        assert!(sample.contains("[identity]"));
        assert!(sample.contains("[transfer]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.cache.max_entries, 1024);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.identity.impersonate_owner = true;
        config.mount.root_handle = Some("0a0b0c".into());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.identity.impersonate_owner);
        assert_eq!(loaded.mount.root_handle.as_deref(), Some("0a0b0c"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nnfs_version = 4\n").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "[mount]\nroot_handle = \"zz\"\n").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "[identity]\nmax_aux_gids = 20\n").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "not toml [").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
