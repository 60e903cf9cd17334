//! Rendezvous protocol messages
//!
//! Messages travel as JSON text frames of the form
//! `{"event": "<name>", "data": {...}}` with camelCase payload fields.

use serde::{Deserialize, Serialize};

use crate::types::{ParticipantInfo, SessionSnapshot};

/// Messages sent by a client to the rendezvous server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Join (or create) a session
    JoinSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        user_name: String,
        /// Title for a newly created session
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Platform tag for a newly created session
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
        /// Requested capacity for a newly created session
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capacity: Option<usize>,
    },

    /// Leave the given session
    LeaveSession { session_id: String },

    /// Controller input from a player
    Input {
        key: String,
        /// "keydown" or "keyup"
        #[serde(rename = "type")]
        kind: String,
        timestamp: u64,
    },

    /// Authoritative state broadcast (host only)
    SyncState {
        state: serde_json::Value,
        timestamp: u64,
    },

    /// Chat line to the rest of the room
    ChatMessage { message: String },

    /// Request a full snapshot of a session
    GetRoomInfo { session_id: String },

    /// Keepalive
    Heartbeat,

    /// Move the session from waiting to playing (host only)
    StartSession { session_id: String },

    /// List open sessions
    GetLobbySessions,
}

/// Messages sent by the rendezvous server to a client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Join acknowledgement
    JoinedSession {
        success: bool,
        is_host: bool,
        player_id: String,
        players: Vec<ParticipantInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<SessionSnapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Request failed or session ended
    SessionError { error: String },

    /// A participant joined the room
    PlayerJoined {
        player: ParticipantInfo,
        players: Vec<ParticipantInfo>,
    },

    /// A participant left the room
    PlayerLeft {
        player_id: String,
        players: Vec<ParticipantInfo>,
    },

    /// Host authority moved to another participant
    HostChanged { host_id: String, host_name: String },

    /// Relayed input from another participant
    PlayerInput {
        player_id: String,
        player_name: String,
        key: String,
        #[serde(rename = "type")]
        kind: String,
        timestamp: u64,
    },

    /// Relayed state from the host
    GameState {
        host_id: String,
        state: serde_json::Value,
        timestamp: u64,
    },

    /// Relayed chat line
    ChatReceived {
        player_id: String,
        player_name: String,
        message: String,
        timestamp: u64,
    },

    /// Full room snapshot
    RoomInfo { session: SessionSnapshot },

    /// Keepalive response
    HeartbeatAck { timestamp: u64 },

    /// Session metadata changed (e.g. started)
    SessionUpdated { session: SessionSnapshot },

    /// Open sessions
    LobbySessions { sessions: Vec<SessionSnapshot> },
}

impl ClientMessage {
    /// Wire event name
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinSession { .. } => "join-session",
            ClientMessage::LeaveSession { .. } => "leave-session",
            ClientMessage::Input { .. } => "input",
            ClientMessage::SyncState { .. } => "sync-state",
            ClientMessage::ChatMessage { .. } => "chat-message",
            ClientMessage::GetRoomInfo { .. } => "get-room-info",
            ClientMessage::Heartbeat => "heartbeat",
            ClientMessage::StartSession { .. } => "start-session",
            ClientMessage::GetLobbySessions => "get-lobby-sessions",
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    /// Create an error message
    pub fn error(message: impl Into<String>) -> Self {
        Self::SessionError {
            error: message.into(),
        }
    }

    /// Create a failed join acknowledgement
    pub fn join_failed(message: impl Into<String>) -> Self {
        Self::JoinedSession {
            success: false,
            is_host: false,
            player_id: String::new(),
            players: Vec::new(),
            session: None,
            error: Some(message.into()),
        }
    }

    /// Wire event name
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::JoinedSession { .. } => "joined-session",
            ServerMessage::SessionError { .. } => "session-error",
            ServerMessage::PlayerJoined { .. } => "player-joined",
            ServerMessage::PlayerLeft { .. } => "player-left",
            ServerMessage::HostChanged { .. } => "host-changed",
            ServerMessage::PlayerInput { .. } => "player-input",
            ServerMessage::GameState { .. } => "game-state",
            ServerMessage::ChatReceived { .. } => "chat-received",
            ServerMessage::RoomInfo { .. } => "room-info",
            ServerMessage::HeartbeatAck { .. } => "heartbeat-ack",
            ServerMessage::SessionUpdated { .. } => "session-updated",
            ServerMessage::LobbySessions { .. } => "lobby-sessions",
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
