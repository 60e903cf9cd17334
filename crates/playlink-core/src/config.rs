//! Configuration system for PlayLink
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/dev.playlink.playlink/config.toml
//! - Linux: ~/.config/playlink/config.toml
//! - Windows: %APPDATA%/playlink/playlink/config/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::types::SignalingEndpoint;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rendezvous server settings
    pub signal: SignalConfig,
    /// Session client settings
    pub client: ClientConfig,
    /// Peer channel settings
    pub peer: PeerConfig,
    /// Rendezvous health monitoring
    pub monitor: MonitorConfig,
    /// Quality thresholds
    pub quality: QualityConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Rendezvous server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Listen port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Sessions idle longer than this are swept (seconds)
    pub session_retention_secs: u64,
    /// How often the idle sweep runs (seconds)
    pub sweep_interval_secs: u64,
    /// Capacity for sessions created without an explicit one
    pub default_capacity: usize,
    /// Upper bound for requested capacities
    pub max_capacity: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            session_retention_secs: 3600, // 1 hour
            sweep_interval_secs: 300,     // 5 minutes
            default_capacity: crate::DEFAULT_SESSION_CAPACITY,
            max_capacity: crate::MAX_SESSION_CAPACITY,
        }
    }
}

impl SignalConfig {
    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Serializable form of a [`RetryPolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self::from(&RetryPolicy::default())
    }
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

impl From<&RetryPolicy> for RetryPolicyConfig {
    fn from(p: &RetryPolicy) -> Self {
        Self {
            max_retries: p.max_retries,
            initial_delay_ms: p.initial_delay.as_millis() as u64,
            max_delay_ms: p.max_delay.as_millis() as u64,
            backoff_multiplier: p.backoff_multiplier,
        }
    }
}

/// Session client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Rendezvous WebSocket URL
    pub rendezvous_url: String,
    /// Join acknowledgement deadline (seconds)
    pub join_timeout_secs: u64,
    /// Heartbeat interval (seconds)
    pub heartbeat_interval_secs: u64,
    /// Initial connection policy
    pub connect_retry: RetryPolicyConfig,
    /// Policy used after the transport drops
    pub reconnect_retry: RetryPolicyConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rendezvous_url: "ws://127.0.0.1:8080".into(),
            join_timeout_secs: 45,
            heartbeat_interval_secs: 30,
            connect_retry: RetryPolicyConfig {
                max_retries: 5,
                initial_delay_ms: 2000,
                max_delay_ms: 10_000,
                backoff_multiplier: 1.5,
            },
            reconnect_retry: RetryPolicyConfig {
                max_retries: 5,
                initial_delay_ms: 1000,
                max_delay_ms: 5000,
                backoff_multiplier: 2.0,
            },
        }
    }
}

impl ClientConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Peer channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Signaling endpoints in priority order
    pub endpoints: Vec<SignalingEndpoint>,
    /// Delay before trying the next endpoint (ms)
    pub failover_delay_ms: u64,
    /// Delay between full passes over the endpoint list (ms)
    pub list_retry_delay_ms: u64,
    /// Full-list retries before peer connectivity is disabled
    pub max_list_retries: u32,
    /// Data channel reconnect attempts
    pub data_reconnect_attempts: u32,
    /// Delay between data channel reconnect attempts (ms)
    pub data_reconnect_delay_ms: u64,
    /// Host capture interval (ms)
    pub capture_interval_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                SignalingEndpoint::new("peer.playlink.dev"),
                SignalingEndpoint::new("peer-eu.playlink.dev"),
            ],
            failover_delay_ms: 1500,
            list_retry_delay_ms: 8000,
            max_list_retries: 2,
            data_reconnect_attempts: 5,
            data_reconnect_delay_ms: 3000,
            capture_interval_ms: 100,
        }
    }
}

impl PeerConfig {
    pub fn failover_delay(&self) -> Duration {
        Duration::from_millis(self.failover_delay_ms)
    }

    pub fn list_retry_delay(&self) -> Duration {
        Duration::from_millis(self.list_retry_delay_ms)
    }

    pub fn data_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.data_reconnect_delay_ms)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms.max(1))
    }
}

/// Rendezvous health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Health endpoint URL (derived from the rendezvous URL if unset)
    pub health_url: Option<String>,
    /// Probe interval (seconds)
    pub interval_secs: u64,
    /// Consecutive failures before reporting offline
    pub failure_threshold: u32,
    /// Per-probe timeout (seconds)
    pub probe_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_url: None,
            interval_secs: 15,
            failure_threshold: 3,
            probe_timeout_secs: 5,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}

/// Quality monitor thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Rolling latency window size
    pub latency_window: usize,
    /// Alert history size
    pub alert_history: usize,
    pub min_fps: u32,
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    pub latency_warning_ms: f64,
    pub latency_critical_ms: f64,
    /// FPS sampling period (ms)
    pub fps_sample_ms: u64,
    /// Memory sampling period (ms)
    pub memory_sample_ms: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            latency_window: 20,
            alert_history: 10,
            min_fps: 30,
            memory_warning_percent: 85.0,
            memory_critical_percent: 95.0,
            latency_warning_ms: 200.0,
            latency_critical_ms: 500.0,
            fps_sample_ms: 1000,
            memory_sample_ms: 5000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Number of recent events kept for diagnostics export
    pub buffer_size: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            buffer_size: 100,
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

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

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
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "playlink", "playlink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Health endpoint URL, derived from the rendezvous URL when not configured
    pub fn health_url(&self) -> String {
        if let Some(url) = &self.monitor.health_url {
            return url.clone();
        }
        let base = self.client.rendezvous_url.trim_end_matches('/');
        let http = if let Some(rest) = base.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = base.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/health", http)
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
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
    /// No config directory available
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No configuration directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}
