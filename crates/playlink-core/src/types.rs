//! Core types shared by the rendezvous server and clients

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle status of a session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Lobby open, not started
    #[default]
    Waiting,
    /// Host has started the session
    Playing,
    /// Session is over
    Finished,
}

impl SessionStatus {
    /// Whether the session should appear in lobby listings
    pub fn is_listed(&self) -> bool {
        matches!(self, SessionStatus::Waiting | SessionStatus::Playing)
    }
}

/// A participant in a session, as seen on the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// Participant id assigned by the server (one per connection)
    pub id: String,
    /// Display name
    pub name: String,
    /// External account id, if the participant is signed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Whether this participant currently holds host authority
    pub is_host: bool,
    /// Join time (unix millis)
    pub joined_at: u64,
}

/// Serializable view of a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub title: String,
    pub platform: String,
    pub capacity: usize,
    pub status: SessionStatus,
    #[serde(default)]
    pub host_id: Option<String>,
    /// Roster ordered by join time
    pub players: Vec<ParticipantInfo>,
    /// Creation time (unix millis)
    pub created_at: u64,
}

impl SessionSnapshot {
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn host(&self) -> Option<&ParticipantInfo> {
        self.players.iter().find(|p| p.is_host)
    }
}

/// Connection state of a logical endpoint (rendezvous or peer)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Never connected or explicitly disconnected
    #[default]
    Idle,
    /// Attempting to connect
    Connecting,
    /// Connected and ready
    Connected,
    /// Connection lost, attempting to reconnect
    Reconnecting,
    /// Gave up
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// State of the direct peer channel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PeerState {
    #[default]
    Idle,
    /// Trying the signaling endpoint at this index
    Resolving(usize),
    /// Registered with the signaling endpoint at this index
    Open(usize),
    /// Recovering a dropped data channel or signaling link
    Reconnecting,
    /// Closed by the owner
    Closed,
    /// Peer connectivity disabled for the rest of the process
    Disabled,
}

impl PeerState {
    pub fn is_open(&self) -> bool {
        matches!(self, PeerState::Open(_))
    }
}

/// Discrete link quality classification
///
/// Always derived from measured latency, never set directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    #[serde(alias = "excellent")]
    Full,
    #[default]
    #[serde(alias = "good")]
    High,
    #[serde(alias = "fair")]
    Medium,
    #[serde(alias = "poor")]
    Low,
}

impl QualityTier {
    /// Classify an average latency in milliseconds
    pub fn from_latency(avg_ms: f64) -> Self {
        if avg_ms < 50.0 {
            QualityTier::Full
        } else if avg_ms < 150.0 {
            QualityTier::High
        } else if avg_ms < 300.0 {
            QualityTier::Medium
        } else {
            QualityTier::Low
        }
    }

    /// Legacy label (excellent/good/fair/poor)
    pub fn alias(&self) -> &'static str {
        match self {
            QualityTier::Full => "excellent",
            QualityTier::High => "good",
            QualityTier::Medium => "fair",
            QualityTier::Low => "poor",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QualityTier::Full => "full",
            QualityTier::High => "high",
            QualityTier::Medium => "medium",
            QualityTier::Low => "low",
        };
        f.write_str(s)
    }
}

/// Encoder quality level for captured frames
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodeQuality {
    High,
    Medium,
    Low,
}

impl EncodeQuality {
    /// Estimated encoded frame size in bytes
    pub fn frame_size(&self) -> u64 {
        match self {
            EncodeQuality::High => 40 * 1024,
            EncodeQuality::Medium => 20 * 1024,
            EncodeQuality::Low => 10 * 1024,
        }
    }
}

/// Capture settings derived from a quality tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProfile {
    pub fps: u32,
    pub quality: EncodeQuality,
}

impl StreamProfile {
    pub fn for_tier(tier: QualityTier) -> Self {
        let (fps, quality) = match tier {
            QualityTier::Full | QualityTier::High => (15, EncodeQuality::High),
            QualityTier::Medium => (10, EncodeQuality::Medium),
            QualityTier::Low => (5, EncodeQuality::Low),
        };
        Self { fps, quality }
    }

    /// Time between captured frames
    pub fn interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }

    /// Estimated bandwidth in bytes per second
    pub fn bandwidth_estimate(&self) -> u64 {
        self.quality.frame_size() * u64::from(self.fps)
    }
}

impl Default for StreamProfile {
    fn default() -> Self {
        Self::for_tier(QualityTier::default())
    }
}

/// A peer signaling endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEndpoint {
    pub host: String,
    #[serde(default = "default_endpoint_port")]
    pub port: u16,
    #[serde(default = "default_endpoint_path")]
    pub path: String,
    #[serde(default = "default_secure")]
    pub secure: bool,
}

fn default_endpoint_port() -> u16 {
    443
}

fn default_endpoint_path() -> String {
    "/".into()
}

fn default_secure() -> bool {
    true
}

impl SignalingEndpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_endpoint_port(),
            path: default_endpoint_path(),
            secure: default_secure(),
        }
    }

    /// Endpoint as a URL string
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}:{}{}", scheme, self.host, self.port, path)
    }
}

impl fmt::Display for SignalingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Snapshot of measured link and runtime quality
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    /// Most recent latency sample (ms)
    pub latency_ms: f64,
    /// Rolling average latency (ms)
    pub average_latency_ms: f64,
    /// Packet loss percentage
    pub packet_loss: f64,
    /// Estimated bandwidth in bytes per second
    pub bandwidth: u64,
    /// Derived from `average_latency_ms`
    pub tier: QualityTier,
    /// Pending input events not yet acknowledged
    pub input_queue: usize,
    /// Frames per second over the last sampling period
    pub fps: u32,
    /// Memory usage percentage, if a source is available
    pub memory_percent: Option<f64>,
}
