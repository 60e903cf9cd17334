//! PlayLink Core - Shared types, protocol definitions, retry and diagnostics
//!
//! This crate contains the foundational types used by the rendezvous server
//! and the client. It has no dependencies on sockets or peer transports.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod types;
pub mod validation;

pub use config::{
    ClientConfig, Config, ConfigError, LoggingConfig, MonitorConfig, PeerConfig, QualityConfig,
    SignalConfig,
};
pub use diagnostics::{CorrelationId, DiagnosticsBuffer, DiagnosticsLayer, LogRecord};
pub use error::{JoinError, SessionError, ValidationError};
pub use protocol::{ClientMessage, ServerMessage};
pub use retry::{CircuitBreakerConfig, CircuitState, RetryManager, RetryPolicy};
pub use types::*;

/// Protocol version advertised by the health endpoint
pub const PROTOCOL_VERSION: u32 = 1;

/// Default number of participants per session
pub const DEFAULT_SESSION_CAPACITY: usize = 4;

/// Hard upper bound on session capacity
pub const MAX_SESSION_CAPACITY: usize = 16;

/// Maximum display name length in characters
pub const MAX_NAME_LEN: usize = 32;

/// Maximum chat message length in characters
pub const MAX_CHAT_LEN: usize = 500;

/// Maximum session id length in characters
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Generate a random 16-hex-character identifier
pub fn generate_id() -> String {
    let mut bytes = [0u8; 8];
    if let Err(e) = getrandom::fill(&mut bytes) {
        tracing::warn!("System RNG unavailable ({}), falling back to clock entropy", e);
        bytes = now_nanos().to_le_bytes();
    }
    hex::encode(bytes)
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn now_nanos() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .max(0) as u64
}
