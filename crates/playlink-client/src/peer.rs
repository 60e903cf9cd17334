//! Direct peer channel between host and players
//!
//! The host streams captured frames to players over a one-way media channel
//! and receives their input over a reliable data channel. Signaling endpoints
//! are tried in priority order; when the whole list keeps failing, peer
//! connectivity is disabled for the rest of the process and the session falls
//! back to rendezvous relay.
//!
//! ```text
//! Idle -> Resolving(i) -> Open(i) -> Reconnecting -> Open(i)
//!              |                          |
//!              +--> Resolving(i+1) <------+  (network/server errors)
//!              +--> Disabled                 (list exhausted)
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use playlink_core::{
    now_millis, EncodeQuality, PeerConfig, PeerState, SessionError, SignalingEndpoint,
    StreamProfile,
};

use crate::quality::FrameCounter;

/// Errors reported by a peer backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeerError {
    #[error("network error: {0}")]
    Network(String),

    #[error("signaling server error: {0}")]
    Server(String),

    #[error("media stream error: {0}")]
    Stream(String),

    #[error("data channel error: {0}")]
    Channel(String),

    #[error("{0}")]
    Other(String),
}

impl PeerError {
    /// Only network and server errors move on to the next endpoint
    pub fn triggers_failover(&self) -> bool {
        matches!(self, PeerError::Network(_) | PeerError::Server(_))
    }
}

/// One encoded frame on the media channel
#[derive(Clone, Debug, PartialEq)]
pub struct MediaFrame {
    pub seq: u64,
    pub timestamp: u64,
    pub quality: EncodeQuality,
    pub data: Bytes,
}

/// Events surfaced by a backend session
#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    /// Lost the signaling server; the session may be reconnected
    Disconnected,
    Error(PeerError),
    DataOpened { remote: String },
    DataClosed { remote: String },
    Data { from: String, payload: Bytes },
    IncomingCall { from: String },
    /// An answered call started delivering media
    Stream { from: String },
    Frame { from: String, frame: MediaFrame },
}

/// A peer identity registered with a signaling endpoint
#[async_trait]
pub trait PeerSession: Send {
    fn id(&self) -> &str;

    /// Next event, or `None` once the session is gone
    ///
    /// Must be cancel safe.
    async fn next_event(&mut self) -> Option<PeerEvent>;

    /// Open a reliable, ordered data channel to `remote`
    async fn connect_data(&mut self, remote: &str) -> Result<(), PeerError>;

    async fn send_data(&mut self, remote: &str, payload: Bytes) -> Result<(), PeerError>;

    /// Start a one-way media call to `remote`
    async fn call(&mut self, remote: &str) -> Result<(), PeerError>;

    async fn answer(&mut self, remote: &str) -> Result<(), PeerError>;

    async fn hang_up(&mut self, remote: &str);

    async fn send_frame(&mut self, remote: &str, frame: &MediaFrame) -> Result<(), PeerError>;

    /// Re-register with the same signaling endpoint
    async fn reconnect(&mut self) -> Result<(), PeerError>;

    /// Release every channel and the registration
    fn close(&mut self);
}

/// Opens peer sessions against signaling endpoints
#[async_trait]
pub trait PeerBackend: Send + Sync {
    async fn open(
        &self,
        endpoint: &SignalingEndpoint,
        peer_id: &str,
    ) -> Result<Box<dyn PeerSession>, PeerError>;
}

/// Produces encoded frames for the host stream
pub trait FrameSource: Send {
    fn capture(&mut self, quality: EncodeQuality) -> Option<Bytes>;
}

/// Owns a backend session and closes it when dropped
pub struct PeerIdentity {
    session: Option<Box<dyn PeerSession>>,
}

impl PeerIdentity {
    pub fn new(session: Box<dyn PeerSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id())
    }

    pub fn session_mut(&mut self) -> Option<&mut (dyn PeerSession + 'static)> {
        self.session.as_deref_mut()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    /// Close the session; later calls do nothing
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!(peer = %session.id(), "Closing peer identity");
            session.close();
        }
    }
}

impl Drop for PeerIdentity {
    fn drop(&mut self) {
        self.close();
    }
}

/// Process-wide "peer connectivity disabled" flag
#[derive(Clone, Debug, Default)]
pub struct PeerLatch(Arc<AtomicBool>);

impl PeerLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_disabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        if !self.0.swap(true, Ordering::AcqRel) {
            warn!("Peer connectivity disabled for this process");
        }
    }
}

/// Notifications for the manager's owner
#[derive(Clone, Debug, PartialEq)]
pub enum PeerNotice {
    Failover { from: usize, to: usize },
    Disabled,
    DataConnected { remote: String },
    DataDisconnected { remote: String },
    /// Gave up re-opening the data channel to the host
    DataChannelFailed { remote: String, attempts: u32 },
    Data { from: String, payload: Bytes },
    StreamReady { from: String },
    Frame { from: String, frame: MediaFrame },
    StreamError(String),
}

/// Which side of the session this manager plays
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerRole {
    Host,
    Player { host_peer_id: String },
}

impl PeerRole {
    fn prefix(&self) -> &'static str {
        match self {
            PeerRole::Host => "host",
            PeerRole::Player { .. } => "player",
        }
    }
}

/// Peer id registered with the signaling server
pub fn peer_id(role: &PeerRole, session_id: &str, user_id: &str) -> String {
    format!("{}-{}-{}-{}", role.prefix(), session_id, user_id, now_millis())
}

enum Command {
    Send {
        to: Option<String>,
        payload: Bytes,
        reply: oneshot::Sender<Result<(), PeerError>>,
    },
    StartStreaming(Box<dyn FrameSource>),
    StopStreaming,
    SetProfile(StreamProfile),
    Close,
}

struct Shared {
    config: PeerConfig,
    backend: Arc<dyn PeerBackend>,
    latch: PeerLatch,
    frames: FrameCounter,
    state_tx: watch::Sender<PeerState>,
    notice_tx: broadcast::Sender<PeerNotice>,
    failovers: AtomicU32,
    frames_sent: AtomicU64,
    /// Last profile handed to `set_profile`, kept across restarts
    profile: Mutex<Option<StreamProfile>>,
}

impl Shared {
    fn set_state(&self, state: PeerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Peer state changed");
        }
    }

    fn notify(&self, notice: PeerNotice) {
        let _ = self.notice_tx.send(notice);
    }

    /// Register `peer_id`, trying endpoints from `start` in priority order
    ///
    /// Each pass over the list is one round; after the last round the latch
    /// is set and the call fails permanently.
    async fn resolve(&self, peer_id: &str, start: usize) -> Result<(PeerIdentity, usize), SessionError> {
        let endpoints = &self.config.endpoints;
        if endpoints.is_empty() {
            warn!("No peer signaling endpoints configured");
            return Err(self.disable());
        }

        let count = endpoints.len();
        for round in 0..=self.config.max_list_retries {
            if round > 0 {
                info!(
                    round,
                    max = self.config.max_list_retries,
                    "All signaling endpoints failed, retrying list in {:?}",
                    self.config.list_retry_delay()
                );
                tokio::time::sleep(self.config.list_retry_delay()).await;
            }

            for step in 0..count {
                if self.latch.is_disabled() {
                    return Err(SessionError::PeerPermanentlyDisabled);
                }

                let index = (start + step) % count;
                if step > 0 {
                    tokio::time::sleep(self.config.failover_delay()).await;
                    let from = (start + step - 1) % count;
                    self.failovers.fetch_add(1, Ordering::Relaxed);
                    self.notify(PeerNotice::Failover { from, to: index });
                }

                let endpoint = &endpoints[index];
                self.set_state(PeerState::Resolving(index));
                match self.backend.open(endpoint, peer_id).await {
                    Ok(session) => {
                        info!(endpoint = %endpoint, peer = %peer_id, "Peer identity registered");
                        self.set_state(PeerState::Open(index));
                        return Ok((PeerIdentity::new(session), index));
                    }
                    Err(e) if e.triggers_failover() => {
                        warn!(endpoint = %endpoint, "Signaling endpoint failed: {}", e);
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint, "Peer registration failed: {}", e);
                        self.set_state(PeerState::Idle);
                        return Err(SessionError::PeerEndpointUnreachable(e.to_string()));
                    }
                }
            }
        }

        Err(self.disable())
    }

    fn disable(&self) -> SessionError {
        self.latch.disable();
        self.set_state(PeerState::Disabled);
        self.notify(PeerNotice::Disabled);
        SessionError::PeerPermanentlyDisabled
    }
}

/// Task that owns the peer identity
struct Driver {
    shared: Arc<Shared>,
    role: PeerRole,
    peer_id: String,
    identity: PeerIdentity,
    endpoint: usize,
    /// Host: players with an open data channel
    players: BTreeSet<String>,
    source: Option<Box<dyn FrameSource>>,
    capture: Option<Interval>,
    /// Capture uses the configured interval until a profile is set
    profile: Option<StreamProfile>,
    seq: u64,
    data_attempts: u32,
    data_retry_at: Option<Instant>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        if let PeerRole::Player { host_peer_id } = self.role.clone() {
            self.connect_to_host(&host_peer_id).await;
        }

        loop {
            let retry_at = self.data_retry_at;
            let streaming = self.source.is_some();

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Close) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                event = next_event(&mut self.identity) => {
                    let event = event.unwrap_or_else(|| {
                        PeerEvent::Error(PeerError::Network("peer session ended".into()))
                    });
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                _ = tick(&mut self.capture), if streaming => self.capture_frame().await,
                _ = sleep_until(retry_at), if retry_at.is_some() => self.retry_data().await,
            }
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { to, payload, reply } => {
                let _ = reply.send(self.send(to, payload).await);
            }
            Command::StartStreaming(source) => {
                info!(players = self.players.len(), "Starting stream");
                self.source = Some(source);
                self.capture = Some(capture_interval(self.capture_period()));
                let players: Vec<String> = self.players.iter().cloned().collect();
                for player in players {
                    self.call(&player).await;
                }
            }
            Command::StopStreaming => self.stop_streaming().await,
            Command::SetProfile(profile) => {
                debug!(fps = profile.fps, quality = ?profile.quality, "Stream profile changed");
                self.profile = Some(profile);
                if self.capture.is_some() {
                    self.capture = Some(capture_interval(profile.interval()));
                }
            }
            Command::Close => {}
        }
    }

    async fn send(&mut self, to: Option<String>, payload: Bytes) -> Result<(), PeerError> {
        let targets: Vec<String> = match (&self.role, to) {
            (_, Some(to)) => vec![to],
            (PeerRole::Player { host_peer_id }, None) => vec![host_peer_id.clone()],
            (PeerRole::Host, None) => self.players.iter().cloned().collect(),
        };

        let Some(session) = self.identity.session_mut() else {
            return Err(PeerError::Channel("peer identity closed".into()));
        };
        for target in targets {
            session.send_data(&target, payload.clone()).await?;
        }
        Ok(())
    }

    /// Handle one backend event; false ends the driver
    async fn handle_event(&mut self, event: PeerEvent) -> bool {
        match event {
            PeerEvent::Disconnected => {
                self.shared.set_state(PeerState::Reconnecting);
                let result = match self.identity.session_mut() {
                    Some(session) => session.reconnect().await,
                    None => Err(PeerError::Network("peer identity closed".into())),
                };
                match result {
                    Ok(()) => {
                        info!("Peer signaling reconnected");
                        self.shared.set_state(PeerState::Open(self.endpoint));
                    }
                    Err(e) => return self.failover(e).await,
                }
            }
            PeerEvent::Error(e) if e.triggers_failover() => return self.failover(e).await,
            PeerEvent::Error(PeerError::Stream(msg)) => {
                debug!("Media stream error: {}", msg);
                self.shared.notify(PeerNotice::StreamError(msg));
            }
            PeerEvent::Error(PeerError::Channel(msg)) => {
                warn!("Data channel error: {}", msg);
                if matches!(self.role, PeerRole::Player { .. }) {
                    self.schedule_data_retry();
                }
            }
            PeerEvent::Error(e) => warn!("Peer error: {}", e),
            PeerEvent::DataOpened { remote } => {
                if self.role == PeerRole::Host {
                    info!(player = %remote, "Player connected");
                    self.players.insert(remote.clone());
                    if self.source.is_some() {
                        self.call(&remote).await;
                    }
                } else {
                    info!("Data channel to host open");
                    self.data_attempts = 0;
                    self.data_retry_at = None;
                }
                self.shared.notify(PeerNotice::DataConnected { remote });
            }
            PeerEvent::DataClosed { remote } => {
                match &self.role {
                    PeerRole::Host => {
                        self.players.remove(&remote);
                    }
                    PeerRole::Player { host_peer_id } => {
                        if *host_peer_id == remote {
                            self.schedule_data_retry();
                        }
                    }
                }
                self.shared.notify(PeerNotice::DataDisconnected { remote });
            }
            PeerEvent::Data { from, payload } => {
                self.shared.notify(PeerNotice::Data { from, payload });
            }
            PeerEvent::IncomingCall { from } => {
                debug!(from = %from, "Answering incoming call");
                if let Some(session) = self.identity.session_mut() {
                    if let Err(e) = session.answer(&from).await {
                        self.shared.notify(PeerNotice::StreamError(e.to_string()));
                    }
                }
            }
            PeerEvent::Stream { from } => {
                info!(from = %from, "Receiving stream");
                self.shared.notify(PeerNotice::StreamReady { from });
            }
            PeerEvent::Frame { from, frame } => {
                self.shared.frames.record();
                self.shared.notify(PeerNotice::Frame { from, frame });
            }
        }
        true
    }

    /// Drop the current identity and register on the next endpoint
    async fn failover(&mut self, cause: PeerError) -> bool {
        warn!(endpoint = self.endpoint, "Peer connection lost: {}", cause);
        self.identity.close();
        self.players.clear();

        let count = self.shared.config.endpoints.len().max(1);
        let start = (self.endpoint + 1) % count;
        tokio::time::sleep(self.shared.config.failover_delay()).await;
        self.shared.failovers.fetch_add(1, Ordering::Relaxed);
        self.shared.notify(PeerNotice::Failover {
            from: self.endpoint,
            to: start,
        });

        match self.shared.resolve(&self.peer_id, start).await {
            Ok((identity, index)) => {
                self.identity = identity;
                self.endpoint = index;
                if let PeerRole::Player { host_peer_id } = self.role.clone() {
                    self.data_attempts = 0;
                    self.connect_to_host(&host_peer_id).await;
                }
                true
            }
            Err(e) => {
                warn!("Peer failover failed: {}", e);
                false
            }
        }
    }

    async fn connect_to_host(&mut self, host_peer_id: &str) {
        let result = match self.identity.session_mut() {
            Some(session) => session.connect_data(host_peer_id).await,
            None => return,
        };
        if let Err(e) = result {
            warn!(host = %host_peer_id, "Data channel connect failed: {}", e);
            self.schedule_data_retry();
        }
    }

    fn schedule_data_retry(&mut self) {
        let PeerRole::Player { host_peer_id } = &self.role else {
            return;
        };
        let max = self.shared.config.data_reconnect_attempts;
        if self.data_attempts >= max {
            warn!(host = %host_peer_id, attempts = max, "Giving up on data channel");
            self.data_retry_at = None;
            self.shared.notify(PeerNotice::DataChannelFailed {
                remote: host_peer_id.clone(),
                attempts: max,
            });
            return;
        }
        self.data_attempts += 1;
        self.data_retry_at = Some(Instant::now() + self.shared.config.data_reconnect_delay());
    }

    async fn retry_data(&mut self) {
        self.data_retry_at = None;
        if let PeerRole::Player { host_peer_id } = self.role.clone() {
            debug!(attempt = self.data_attempts, "Retrying data channel");
            self.connect_to_host(&host_peer_id).await;
        }
    }

    async fn call(&mut self, remote: &str) {
        let Some(session) = self.identity.session_mut() else {
            return;
        };
        if let Err(e) = session.call(remote).await {
            warn!(player = %remote, "Media call failed: {}", e);
            self.shared.notify(PeerNotice::StreamError(e.to_string()));
        }
    }

    fn capture_period(&self) -> Duration {
        match self.profile {
            Some(profile) => profile.interval(),
            None => self.shared.config.capture_interval(),
        }
    }

    async fn capture_frame(&mut self) {
        let quality = self.profile.unwrap_or_default().quality;
        let Some(data) = self.source.as_mut().and_then(|s| s.capture(quality)) else {
            return;
        };

        self.seq += 1;
        let frame = MediaFrame {
            seq: self.seq,
            timestamp: now_millis(),
            quality,
            data,
        };

        let Some(session) = self.identity.session_mut() else {
            return;
        };
        for player in &self.players {
            if let Err(e) = session.send_frame(player, &frame).await {
                debug!(player = %player, "Frame send failed: {}", e);
            }
        }
        self.shared.frames.record();
        self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    async fn stop_streaming(&mut self) {
        if self.source.take().is_none() {
            return;
        }
        self.capture = None;
        if let Some(session) = self.identity.session_mut() {
            for player in &self.players {
                session.hang_up(player).await;
            }
        }
        info!("Stream stopped");
    }

    async fn shutdown(&mut self) {
        self.stop_streaming().await;
        self.identity.close();
        if *self.shared.state_tx.borrow() != PeerState::Disabled {
            self.shared.set_state(PeerState::Closed);
        }
    }
}

async fn next_event(identity: &mut PeerIdentity) -> Option<PeerEvent> {
    match identity.session_mut() {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn capture_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Manages one peer identity as host or player
pub struct PeerConnectionManager {
    shared: Arc<Shared>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    peer_id: Mutex<Option<String>>,
}

impl PeerConnectionManager {
    pub fn new(
        config: PeerConfig,
        backend: Arc<dyn PeerBackend>,
        latch: PeerLatch,
        frames: FrameCounter,
    ) -> Self {
        let (state_tx, _) = watch::channel(PeerState::Idle);
        let (notice_tx, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                config,
                backend,
                latch,
                frames,
                state_tx,
                notice_tx,
                failovers: AtomicU32::new(0),
                frames_sent: AtomicU64::new(0),
                profile: Mutex::new(None),
            }),
            commands: Mutex::new(None),
            task: Mutex::new(None),
            peer_id: Mutex::new(None),
        }
    }

    /// Register as host, returning the peer id players connect to
    pub async fn start_host(&self, session_id: &str, user_id: &str) -> Result<String, SessionError> {
        self.start(PeerRole::Host, session_id, user_id).await
    }

    /// Register as player and open a data channel to the host
    pub async fn start_player(
        &self,
        session_id: &str,
        user_id: &str,
        host_peer_id: &str,
    ) -> Result<String, SessionError> {
        let role = PeerRole::Player {
            host_peer_id: host_peer_id.to_string(),
        };
        self.start(role, session_id, user_id).await
    }

    async fn start(&self, role: PeerRole, session_id: &str, user_id: &str) -> Result<String, SessionError> {
        if self.shared.latch.is_disabled() {
            debug!("Peer connectivity disabled, not starting");
            return Err(SessionError::PeerPermanentlyDisabled);
        }
        self.close().await;

        let peer_id = peer_id(&role, session_id, user_id);
        let (identity, endpoint) = self.shared.resolve(&peer_id, 0).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            shared: self.shared.clone(),
            role,
            peer_id: peer_id.clone(),
            identity,
            endpoint,
            players: BTreeSet::new(),
            source: None,
            capture: None,
            profile: *self.shared.profile.lock(),
            seq: 0,
            data_attempts: 0,
            data_retry_at: None,
        };

        let span = info_span!("peer", peer = %peer_id);
        let handle = tokio::spawn(driver.run(rx).instrument(span));
        *self.commands.lock() = Some(tx);
        *self.task.lock() = Some(handle);
        *self.peer_id.lock() = Some(peer_id.clone());
        Ok(peer_id)
    }

    /// Send on the data channel
    ///
    /// Players send to the host; the host sends to `to`, or to every
    /// connected player when `to` is `None`.
    pub async fn send(&self, to: Option<&str>, payload: Bytes) -> Result<(), PeerError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Send {
            to: to.map(str::to_string),
            payload,
            reply,
        };
        if !self.command(cmd) {
            return Err(PeerError::Channel("peer connection not started".into()));
        }
        rx.await
            .unwrap_or_else(|_| Err(PeerError::Channel("peer connection closed".into())))
    }

    /// Start capturing from `source` and streaming to every player
    pub fn start_streaming(&self, source: Box<dyn FrameSource>) -> bool {
        self.command(Command::StartStreaming(source))
    }

    pub fn stop_streaming(&self) -> bool {
        self.command(Command::StopStreaming)
    }

    /// Retune capture rate and encode quality
    ///
    /// The profile also applies to identities started later; returns false
    /// when no identity is running yet.
    pub fn set_profile(&self, profile: StreamProfile) -> bool {
        *self.shared.profile.lock() = Some(profile);
        self.command(Command::SetProfile(profile))
    }

    /// Count one frame for FPS accounting
    pub fn record_frame(&self) {
        self.shared.frames.record();
    }

    /// Release the identity, stop streaming and close every channel
    pub async fn close(&self) {
        let sender = self.commands.lock().take();
        if let Some(tx) = sender {
            let _ = tx.send(Command::Close);
        }

        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if timeout(Duration::from_secs(2), &mut handle).await.is_err() {
                // Aborting drops the identity, which closes it
                handle.abort();
                if self.state() != PeerState::Disabled {
                    self.shared.set_state(PeerState::Closed);
                }
            }
        }
        self.peer_id.lock().take();
    }

    pub fn peer_id(&self) -> Option<String> {
        self.peer_id.lock().clone()
    }

    pub fn state(&self) -> PeerState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PeerState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerNotice> {
        self.shared.notice_tx.subscribe()
    }

    pub fn failover_count(&self) -> u32 {
        self.shared.failovers.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::Relaxed)
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.latch.is_disabled()
    }

    fn command(&self, cmd: Command) -> bool {
        match self.commands.lock().as_ref() {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
