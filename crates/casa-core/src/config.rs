//! Configuration system for Casa
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/casa/config.toml
//! - Linux: ~/.config/casa/config.toml
//! - Windows: %APPDATA%/casa/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signaling relay settings
    pub relay: RelayConfig,
    /// Viewer/client settings
    pub viewer: ViewerConfig,
    /// Network settings
    pub network: NetworkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            viewer: ViewerConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay listen port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Connection-record database path (None = in-memory)
    pub db_path: Option<PathBuf>,
    /// Public relay URL (for clients)
    pub public_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_RELAY_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            db_path: None,
            public_url: None,
        }
    }
}

/// Viewer/client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Signaling relay URL
    pub relay_url: String,
    /// Number of peer connections to pre-warm at pool init
    pub pre_connections: usize,
    /// Pool initialization timeout in seconds
    pub init_timeout_secs: u64,
    /// Offer/answer negotiation timeout in seconds
    pub negotiation_timeout_secs: u64,
    /// Session registry directory (uses the platform data dir if None)
    pub session_dir: Option<PathBuf>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            relay_url: "wss://relay.casa.dev".to_string(),
            pre_connections: crate::DEFAULT_PRE_CONNECTIONS,
            init_timeout_secs: 15,
            negotiation_timeout_secs: 30,
            session_dir: None,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Socket connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Maximum signaling reconnect attempts (0 = no retry)
    pub reconnect_max_attempts: u32,
    /// Initial delay before the first reconnect attempt, in seconds
    pub reconnect_initial_delay_secs: u64,
    /// Maximum delay between reconnect attempts, in seconds
    pub reconnect_max_delay_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            reconnect_max_attempts: 5,
            reconnect_initial_delay_secs: 1,
            reconnect_max_delay_secs: 60,
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

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "casa", "casa")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the default data directory (session registry lives here)
    pub fn default_data_dir() -> Option<PathBuf> {
        ProjectDirs::from("com", "casa", "casa")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Get the effective session directory (config override or system default)
    pub fn session_dir(&self) -> PathBuf {
        self.viewer.session_dir.clone()
            .or_else(Self::default_data_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp/casa"))
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
