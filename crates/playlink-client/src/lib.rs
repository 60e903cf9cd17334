//! PlayLink Client - session membership, peer media and connection quality
//!
//! This crate provides:
//! - [`SessionClient`]: joins sessions through the rendezvous server and keeps
//!   the membership alive across reconnects
//! - [`PeerConnectionManager`]: direct host/player channel with endpoint failover
//! - [`ConnectionMonitor`] and [`QualityMonitor`]: server health and link quality
//! - [`ClientContext`]: wires the above together once per process
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── ClientContext ───────────────────────────┐
//! │                                                                      │
//! │  SessionClient ── WebSocket ──► rendezvous server (playlink-signal)  │
//! │       │ heartbeat RTT                                                │
//! │       ▼                                                              │
//! │  QualityMonitor ── tier ──► PeerConnectionManager ── peer backend    │
//! │                                                                      │
//! │  ConnectionMonitor ── HTTP GET /health                               │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The rendezvous link and the peer channel fail independently. When peer
//! connectivity is disabled the session keeps working over rendezvous relay.

pub mod context;
pub mod monitor;
pub mod peer;
pub mod quality;
pub mod session;
pub mod transport;

pub use context::ClientContext;
pub use monitor::{ConnectionMonitor, HealthProbe, HttpHealthProbe, MonitorStatus, ServerStatus};
pub use peer::{
    FrameSource, MediaFrame, PeerBackend, PeerConnectionManager, PeerError, PeerEvent,
    PeerIdentity, PeerLatch, PeerNotice, PeerRole, PeerSession,
};
pub use quality::{AlertKind, AlertLevel, FrameCounter, MemorySource, QualityAlert, QualityMonitor};
pub use session::{Membership, ProgressObserver, SessionClient};
pub use transport::{RendezvousConnector, RendezvousLink, WsConnector, WsLink};
