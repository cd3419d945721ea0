//! Configuration system for Tendril.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. explicit path passed by the daemon (first CLI argument)
//!   2. $TENDRIL_CONFIG
//!   3. $XDG_CONFIG_HOME/tendril/config.toml
//!   4. ~/.config/tendril/config.toml

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TendrilConfig {
    pub network: NetworkConfig,
    pub mesh: MeshConfig,
    pub timing: TimingConfig,
    pub access: AccessConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address the mesh socket binds to.
    pub listen: String,
    /// Address advertised to peers in sync headers. Empty = `listen`.
    pub local_address: String,
    /// Statically configured peers. Never evicted.
    pub bootstrap: Vec<String>,
    /// TCP address of the status endpoint.
    pub status_listen: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Shared secret carried in every sync header.
    pub token: u64,
    /// Groups this node belongs to.
    pub group: u64,
    /// Groups this node refuses to probe or propagate.
    pub group_filter: u64,
    /// Server nodes run the health check and drive reconnection.
    pub server: bool,
}

/// Timing parameters in milliseconds. Zero means "use the default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub ping_every_ms: u64,
    pub sync_every_ms: u64,
    pub check_every_ms: u64,
    pub delete_every_ms: u64,
    pub offline_time_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Endpoint of the upstream access-control service.
    pub url: String,
    /// Run the backoff state machine without calling the service.
    pub test_mode: bool,
    pub credentials: Vec<CredentialConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub name: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Fallback filter when RUST_LOG is unset, e.g. "info" or "tendril_services=debug".
    pub level: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_PING_EVERY_MS: u64 = 500;
pub const DEFAULT_SYNC_EVERY_MS: u64 = 6_000;
pub const DEFAULT_CHECK_EVERY_MS: u64 = 12_000;
pub const DEFAULT_DELETE_EVERY_MS: u64 = 600_000;
pub const DEFAULT_OFFLINE_TIME_MS: u64 = 6_000;

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:4432".to_string(),
            local_address: String::new(),
            bootstrap: Vec::new(),
            status_listen: "127.0.0.1:4433".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn or_default(ms: u64, default: u64) -> Duration {
    Duration::from_millis(if ms == 0 { default } else { ms })
}

impl TimingConfig {
    pub fn ping_every(&self) -> Duration {
        or_default(self.ping_every_ms, DEFAULT_PING_EVERY_MS)
    }

    pub fn sync_every(&self) -> Duration {
        or_default(self.sync_every_ms, DEFAULT_SYNC_EVERY_MS)
    }

    pub fn check_every(&self) -> Duration {
        or_default(self.check_every_ms, DEFAULT_CHECK_EVERY_MS)
    }

    pub fn delete_every(&self) -> Duration {
        or_default(self.delete_every_ms, DEFAULT_DELETE_EVERY_MS)
    }

    pub fn offline_time(&self) -> Duration {
        or_default(self.offline_time_ms, DEFAULT_OFFLINE_TIME_MS)
    }
}

// ── Resolved addresses ────────────────────────────────────────────────────────

impl NetworkConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.listen)
    }

    /// The IPv4 address advertised to peers. Peers gossip it back to us, so
    /// it must be the concrete address they reach us on, never a wildcard.
    pub fn advertised_addr(&self) -> Result<SocketAddrV4, ConfigError> {
        let raw = if self.local_address.is_empty() {
            &self.listen
        } else {
            &self.local_address
        };
        let addr = parse_v4(raw)?;
        if addr.ip().is_unspecified() {
            return Err(ConfigError::UnspecifiedAddress(raw.to_string()));
        }
        Ok(addr)
    }

    pub fn bootstrap_addrs(&self) -> Result<Vec<SocketAddrV4>, ConfigError> {
        self.bootstrap.iter().map(|s| parse_v4(s)).collect()
    }

    pub fn status_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.status_listen)
    }
}

fn parse_addr(raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::InvalidAddress(raw.to_string()))
}

fn parse_v4(raw: &str) -> Result<SocketAddrV4, ConfigError> {
    match parse_addr(raw)? {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(_) => Err(ConfigError::NotIpv4(raw.to_string())),
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("tendril")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid socket address: {0}")]
    InvalidAddress(String),
    #[error("mesh addresses must be IPv4: {0}")]
    NotIpv4(String),
    #[error("cannot advertise wildcard address {0}; set network.local_address")]
    UnspecifiedAddress(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TendrilConfig {
    /// Load config from the default location: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load config from an explicit path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            TendrilConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TENDRIL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists at `path`. Returns the path.
    pub fn write_default_if_missing(path: &Path) -> Result<PathBuf, ConfigError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            }
            let text = toml::to_string_pretty(&TendrilConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(path, text)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        Ok(path.to_path_buf())
    }

    /// Apply TENDRIL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TENDRIL_NETWORK__LISTEN") {
            self.network.listen = v;
        }
        if let Ok(v) = std::env::var("TENDRIL_NETWORK__LOCAL_ADDRESS") {
            self.network.local_address = v;
        }
        if let Ok(v) = std::env::var("TENDRIL_MESH__TOKEN") {
            if let Ok(t) = v.parse() {
                self.mesh.token = t;
            }
        }
        if let Ok(v) = std::env::var("TENDRIL_MESH__SERVER") {
            self.mesh.server = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TENDRIL_ACCESS__TEST_MODE") {
            self.access.test_mode = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TENDRIL_LOG__LEVEL") {
            self.log.level = v;
        }
    }
}
