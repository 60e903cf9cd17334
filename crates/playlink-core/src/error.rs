//! Error types for PlayLink sessions

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the client-side session machinery
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("transport not initialized")]
    TransportNotInitialized,

    #[error("transport not connected")]
    TransportNotConnected,

    #[error("transport disconnected")]
    TransportDisconnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("join timed out after {0:?}")]
    JoinTimeout(Duration),

    #[error("join rejected: {0}")]
    JoinRejected(String),

    #[error("peer endpoint unreachable: {0}")]
    PeerEndpointUnreachable(String),

    #[error("peer connectivity permanently disabled")]
    PeerPermanentlyDisabled,

    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("validation failed for {event}: {}", reasons.join("; "))]
    ValidationFailed { event: String, reasons: Vec<String> },

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{operation} timed out after {after:?}")]
    OperationTimeout { operation: String, after: Duration },
}

impl SessionError {
    /// Join failures are all treated as "not joined" by callers
    pub fn is_join_failure(&self) -> bool {
        matches!(
            self,
            SessionError::JoinTimeout(_)
                | SessionError::JoinRejected(_)
                | SessionError::TransportDisconnected
        )
    }

    /// Whether retrying the same operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::TransportNotConnected
                | SessionError::TransportDisconnected
                | SessionError::Transport(_)
                | SessionError::JoinTimeout(_)
                | SessionError::PeerEndpointUnreachable(_)
                | SessionError::OperationTimeout { .. }
        )
    }
}

impl From<ValidationError> for SessionError {
    fn from(e: ValidationError) -> Self {
        SessionError::ValidationFailed {
            event: e.event,
            reasons: e.reasons,
        }
    }
}

/// Server-side join refusals
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("session is full ({capacity} players)")]
    SessionFull { capacity: usize },

    #[error("invalid join request: {0}")]
    InvalidRequest(String),
}

/// Schema check failure for an inbound message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {event}: {}", reasons.join("; "))]
pub struct ValidationError {
    pub event: String,
    pub reasons: Vec<String>,
}

impl ValidationError {
    pub fn new(event: impl Into<String>, reasons: Vec<String>) -> Self {
        Self {
            event: event.into(),
            reasons,
        }
    }
}
