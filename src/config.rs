// src/config.rs
//! Configuration file handling
//!
//! ```toml
//! [download]
//! timeout_ms = 10000
//! cache_dir = "/var/cache/fdroid-net"
//!
//! [tor]
//! enabled = true
//!
//! [swap]
//! web_root = "/var/lib/fdroid-net/swap"
//! port = 8888
//! https = true
//! ```
//!
//! A missing file means "all defaults".

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default connect and per-read timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Timeout for Tor circuits and onion services
pub const TOR_TIMEOUT_MS: u64 = 300_000;

/// Fixed name of the persisted swap keystore
pub const KEYSTORE_FILE_NAME: &str = "swap.keystore";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub download: DownloadConfig,
    pub tor: TorConfig,
    pub mirrors: MirrorConfig,
    pub dns: DnsConfig,
    pub cache: CacheConfig,
    pub swap: SwapConfig,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults if absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Invalid config {}: {e}", path.display())))
    }

    /// Write configuration as pretty TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {e}")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
            .map_err(|e| Error::IoError(format!("Failed to write {}: {e}", path.display())))
    }
}

/// Transfer settings shared by all transports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Connect and per-read timeout in milliseconds
    pub timeout_ms: u64,
    /// Root of the per-host download cache
    pub cache_dir: PathBuf,
    pub user_agent: String,
    /// Optional HTTP(S) proxy for non-swap traffic
    pub proxy: Option<String>,
    /// Extra `key=value&...` parameters appended to every request
    pub query_string: Option<String>,
    /// Local network in CIDR form, used to recognise swap peers
    pub local_subnet: Option<String>,
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            cache_dir: std::env::temp_dir().join("fdroid-net").join("downloads"),
            user_agent: format!("fdroid-net/{}", env!("CARGO_PKG_VERSION")),
            proxy: None,
            query_string: None,
            local_subnet: None,
        }
    }
}

/// Tor routing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    /// Route every non-swap request through Tor
    pub enabled: bool,
    pub socks_proxy: String,
    pub timeout_ms: u64,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socks_proxy: "socks5h://127.0.0.1:9050".to_string(),
            timeout_ms: TOR_TIMEOUT_MS,
        }
    }
}

/// Mirror ranking state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Where error counts survive restarts (None = memory only)
    pub state_file: Option<PathBuf>,
    /// ISO country code preferred when mirrors declare a location
    pub preferred_location: Option<String>,
}

/// DNS cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enabled: bool,
    pub state_file: Option<PathBuf>,
}

/// Verified artifact cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep verified packages for reuse
    pub keep_artifacts: bool,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keep_artifacts: false,
            dir: std::env::temp_dir().join("fdroid-net").join("artifacts"),
        }
    }
}

/// Local swap server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    pub web_root: PathBuf,
    pub keystore_path: PathBuf,
    pub port: u16,
    pub https: bool,
    /// Human readable repo name; the local address is appended
    pub repo_name: String,
    /// RFCOMM channel for the Bluetooth server (None = disabled)
    pub bluetooth_channel: Option<u8>,
}

impl Default for SwapConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("fdroid-net");
        Self {
            web_root: base.join("swap"),
            keystore_path: base.join(KEYSTORE_FILE_NAME),
            port: 8888,
            https: false,
            repo_name: "fdroid-net".to_string(),
            bluetooth_channel: None,
        }
    }
}
