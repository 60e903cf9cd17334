//! PlayLink Signal Server
//!
//! Rendezvous service for session matchmaking and control traffic.
//! Clients connect via WebSocket and exchange JSON events.
//!
//! # Protocol
//!
//! 1. The first client to join a session id creates it and becomes host
//! 2. Later clients join as players until the session is full
//! 3. Input and chat are relayed to the rest of the room; state only from the host
//! 4. When the host leaves, the earliest remaining player is promoted
//! 5. Empty sessions are removed at once, idle ones by a periodic sweep

pub mod registry;
pub mod server;
pub mod session;

pub use registry::{JoinOutcome, JoinRequest, Outbox, SessionRegistry};
pub use server::SignalServer;
pub use session::Session;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 8080;
