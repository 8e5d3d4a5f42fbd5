//! Configuration system for Natter.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $NATTER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/natter/config.toml
//!   3. ~/.config/natter/config.toml
//!
//! Everything is read once at startup; nothing rereads configuration at
//! runtime. Defaults match the wire-protocol constants the deployed
//! clients assume (chat on 8080, rendezvous on 8081, 40 KiB frames).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatterConfig {
    pub network: NetworkConfig,
    pub limits: LimitsConfig,
    pub rate: RateConfig,
    pub heartbeat: HeartbeatConfig,
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the listeners bind. Connect-side tools default to it too.
    pub bind_host: String,
    /// TCP port of the broadcast chat server.
    pub chat_port: u16,
    /// TCP port the peer application listens on.
    pub peer_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Registrations the chat server accepts before rejecting with a
    /// full-capacity error.
    pub max_clients: usize,
    /// Links the peer application keeps before rejecting.
    pub max_peers: usize,
    /// Decode-side frame cap in bytes. Encoding is never capped.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Plain chat frames admitted per window per connection.
    pub max_messages: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Seconds between monitor scans.
    pub interval_secs: u64,
    /// Base liveness timeout in seconds; a connection silent for more
    /// than twice this is evicted without a probe.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Seconds a fresh connection gets to send its setup frame.
    pub setup_secs: u64,
    /// Seconds an outbound dial gets to establish.
    pub connect_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NatterConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            limits: LimitsConfig::default(),
            rate: RateConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            chat_port: 8080,
            peer_port: 8081,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: 100,
            max_peers: 50,
            max_frame_bytes: crate::wire::MAX_FRAME_BYTES,
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            window_secs: 1,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            timeout_secs: 300,
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            setup_secs: 10,
            connect_secs: 10,
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl RateConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TimeoutsConfig {
    pub fn setup(&self) -> Duration {
        Duration::from_secs(self.setup_secs)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("natter")
}

fn home_or_tmp() -> PathBuf {
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NatterConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_path(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit path, falling back to defaults when the
    /// file does not exist. No environment overrides applied.
    pub fn load_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(NatterConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("NATTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&NatterConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply NATTER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NATTER_NETWORK__BIND_HOST") {
            self.network.bind_host = v;
        }
        if let Ok(v) = std::env::var("NATTER_NETWORK__CHAT_PORT") {
            if let Ok(p) = v.parse() {
                self.network.chat_port = p;
            }
        }
        if let Ok(v) = std::env::var("NATTER_NETWORK__PEER_PORT") {
            if let Ok(p) = v.parse() {
                self.network.peer_port = p;
            }
        }
        if let Ok(v) = std::env::var("NATTER_LIMITS__MAX_CLIENTS") {
            if let Ok(n) = v.parse() {
                self.limits.max_clients = n;
            }
        }
        if let Ok(v) = std::env::var("NATTER_LIMITS__MAX_PEERS") {
            if let Ok(n) = v.parse() {
                self.limits.max_peers = n;
            }
        }
        if let Ok(v) = std::env::var("NATTER_HEARTBEAT__INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.heartbeat.interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("NATTER_HEARTBEAT__TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.heartbeat.timeout_secs = n;
            }
        }
    }
}
