//! Session client: join/leave, relay and reconnection over the rendezvous link
//!
//! A single background task owns the link. It multiplexes outbound messages,
//! inbound events and the heartbeat timer, and when the link drops it
//! reconnects with backoff and rejoins the last session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use playlink_core::validation::validate_server_message;
use playlink_core::{
    now_millis, ClientConfig, ClientMessage, ConnectionState, CorrelationId, ParticipantInfo,
    RetryManager, ServerMessage, SessionError,
};

use crate::transport::{RendezvousConnector, RendezvousLink};

/// Connect retry progress observer: `(attempt, max_retries, delay)`
pub type ProgressObserver = Arc<dyn Fn(u32, u32, Duration) + Send + Sync>;

/// Current membership as known to this client
#[derive(Clone, Debug, PartialEq)]
pub struct Membership {
    pub session_id: String,
    pub participant_id: String,
    /// Local view of host authority; the server enforces the real one
    pub is_host: bool,
    pub roster: Vec<ParticipantInfo>,
}

#[derive(Clone, Debug)]
struct JoinParams {
    session_id: String,
    user_name: String,
    user_id: Option<String>,
}

impl JoinParams {
    fn message(&self) -> ClientMessage {
        ClientMessage::JoinSession {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            title: None,
            platform: None,
            capacity: None,
        }
    }
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn RendezvousConnector>,
    retry: Arc<RetryManager>,
    correlation_id: CorrelationId,
    state_tx: watch::Sender<ConnectionState>,
    latency_tx: watch::Sender<Option<Duration>>,
    events_tx: broadcast::Sender<ServerMessage>,
    membership: Mutex<Option<Membership>>,
    last_join: Mutex<Option<JoinParams>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    progress: Mutex<Option<ProgressObserver>>,
}

/// Client facade over the rendezvous transport
pub struct SessionClient {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl SessionClient {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn RendezvousConnector>,
        retry: Arc<RetryManager>,
        correlation_id: CorrelationId,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (latency_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                retry,
                correlation_id,
                state_tx,
                latency_tx,
                events_tx,
                membership: Mutex::new(None),
                last_join: Mutex::new(None),
                outbound: Mutex::new(None),
                progress: Mutex::new(None),
            }),
            task: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Observe connect retries
    pub fn set_progress_observer(&self, observer: ProgressObserver) {
        *self.inner.progress.lock() = Some(observer);
    }

    /// Connect to the rendezvous server
    ///
    /// Reuses an existing connection. While the background task is
    /// reconnecting, waits for it to finish instead of opening a second link.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _guard = self.connect_lock.lock().await;

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Reconnecting => return self.wait_for_reconnect().await,
            _ => {}
        }

        self.inner.set_state(ConnectionState::Connecting);
        let link = match self.inner.open_link(&self.inner.config.connect_retry.policy(), true).await {
            Ok(link) => link,
            Err(e) => {
                self.inner.set_state(ConnectionState::Failed);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbound.lock() = Some(tx);
        self.inner.set_state(ConnectionState::Connected);

        let span = info_span!("rendezvous", correlation_id = %self.inner.correlation_id);
        let handle = tokio::spawn(run_link(self.inner.clone(), link, rx).instrument(span));
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    async fn wait_for_reconnect(&self) -> Result<(), SessionError> {
        let mut state = self.inner.state_tx.subscribe();
        loop {
            match *state.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Reconnecting | ConnectionState::Connecting => {}
                _ => return Err(SessionError::TransportNotConnected),
            }
            if state.changed().await.is_err() {
                return Err(SessionError::TransportDisconnected);
            }
        }
    }

    /// Close the connection and forget the membership
    pub async fn disconnect(&self) {
        self.inner.outbound.lock().take();
        self.inner.membership.lock().take();
        self.inner.last_join.lock().take();

        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            // Dropping the sender lets the task close the link gracefully
            if timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.inner.set_state(ConnectionState::Idle);
        info!("Disconnected from rendezvous server");
    }

    /// Join a session, waiting for the server's acknowledgement
    ///
    /// Fails with `JoinTimeout` after the configured deadline, `JoinRejected`
    /// if the server refuses, and `TransportDisconnected` if the link drops
    /// first.
    pub async fn join(&self, session_id: &str, user_name: &str) -> Result<Membership, SessionError> {
        self.join_as(session_id, user_name, None).await
    }

    /// Join with an external user id
    pub async fn join_as(
        &self,
        session_id: &str,
        user_name: &str,
        user_id: Option<String>,
    ) -> Result<Membership, SessionError> {
        self.ensure_connected()?;

        // Subscribe before sending so the ack cannot be missed
        let mut events = self.inner.events_tx.subscribe();
        let mut state = self.inner.state_tx.subscribe();

        let params = JoinParams {
            session_id: session_id.to_string(),
            user_name: user_name.to_string(),
            user_id,
        };
        *self.inner.last_join.lock() = Some(params.clone());

        if !self.emit(params.message()) {
            self.inner.last_join.lock().take();
            return Err(SessionError::TransportNotConnected);
        }
        info!(session = %session_id, "Joining session");

        let deadline = self.inner.config.join_timeout();
        let wait = async {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ServerMessage::JoinedSession { success: true, is_host, player_id, players, session, .. }) => {
                            if session.as_ref().is_some_and(|s| s.id != session_id) {
                                continue;
                            }
                            return Ok(Membership {
                                session_id: session_id.to_string(),
                                participant_id: player_id,
                                is_host,
                                roster: players,
                            });
                        }
                        Ok(ServerMessage::JoinedSession { success: false, error, .. }) => {
                            return Err(SessionError::JoinRejected(
                                error.unwrap_or_else(|| "join refused".into()),
                            ));
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(SessionError::TransportDisconnected);
                        }
                    },
                    changed = state.changed() => {
                        if changed.is_err() || *state.borrow() != ConnectionState::Connected {
                            return Err(SessionError::TransportDisconnected);
                        }
                    }
                }
            }
        };

        let result = match timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::JoinTimeout(deadline)),
        };

        match &result {
            Ok(m) => info!(session = %session_id, participant = %m.participant_id, is_host = m.is_host, "Joined session"),
            Err(e) => {
                warn!(session = %session_id, "Join failed: {}", e);
                self.inner.last_join.lock().take();
            }
        }
        result
    }

    /// Leave the current session
    pub fn leave(&self) -> bool {
        self.inner.last_join.lock().take();
        let Some(membership) = self.inner.membership.lock().take() else {
            return false;
        };
        info!(session = %membership.session_id, "Leaving session");
        self.emit(ClientMessage::LeaveSession {
            session_id: membership.session_id,
        })
    }

    /// Send controller input (fire and forget)
    pub fn send_input(&self, key: &str, kind: &str) -> bool {
        self.emit(ClientMessage::Input {
            key: key.to_string(),
            kind: kind.to_string(),
            timestamp: now_millis(),
        })
    }

    /// Broadcast authoritative state; only sent while this client is host
    pub fn sync_state(&self, state: serde_json::Value) -> bool {
        if !self.is_host() {
            debug!("Not host, state sync skipped");
            return false;
        }
        self.emit(ClientMessage::SyncState {
            state,
            timestamp: now_millis(),
        })
    }

    /// Send a chat line (fire and forget)
    pub fn send_chat(&self, message: &str) -> bool {
        self.emit(ClientMessage::ChatMessage {
            message: message.to_string(),
        })
    }

    /// Ask for a full snapshot of the current session
    pub fn request_room_info(&self) -> bool {
        match self.session_id() {
            Some(session_id) => self.emit(ClientMessage::GetRoomInfo { session_id }),
            None => false,
        }
    }

    /// Ask the server to move the current session to playing
    pub fn start_session(&self) -> bool {
        match self.session_id() {
            Some(session_id) => self.emit(ClientMessage::StartSession { session_id }),
            None => false,
        }
    }

    /// Ask for the list of open sessions
    pub fn request_lobby(&self) -> bool {
        self.emit(ClientMessage::GetLobbySessions)
    }

    /// Queue a message; false when not connected
    pub fn emit(&self, msg: ClientMessage) -> bool {
        if self.state() != ConnectionState::Connected {
            debug!("Not connected, dropping {}", msg.event_name());
            return false;
        }
        match self.inner.outbound.lock().as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Subscribe to every validated server event
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inner.events_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Heartbeat round-trip times
    pub fn watch_latency(&self) -> watch::Receiver<Option<Duration>> {
        self.inner.latency_tx.subscribe()
    }

    pub fn membership(&self) -> Option<Membership> {
        self.inner.membership.lock().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner
            .membership
            .lock()
            .as_ref()
            .map(|m| m.session_id.clone())
    }

    pub fn is_host(&self) -> bool {
        self.inner
            .membership
            .lock()
            .as_ref()
            .map(|m| m.is_host)
            .unwrap_or(false)
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.inner.outbound.lock().is_none() && self.state() == ConnectionState::Idle {
            return Err(SessionError::TransportNotInitialized);
        }
        if self.state() != ConnectionState::Connected {
            return Err(SessionError::TransportNotConnected);
        }
        Ok(())
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Rendezvous state changed");
        }
    }

    async fn open_link(
        &self,
        policy: &playlink_core::RetryPolicy,
        observe: bool,
    ) -> Result<Box<dyn RendezvousLink>, SessionError> {
        let progress = if observe { self.progress.lock().clone() } else { None };
        let connector = &self.connector;
        self.retry
            .execute_with_retry_observed(
                "rendezvous-connect",
                policy,
                |_| connector.connect(),
                |attempt, max, delay| {
                    if let Some(observer) = &progress {
                        observer(attempt, max, delay);
                    }
                },
            )
            .await
    }

    /// Apply an inbound message to local state, then publish it
    fn handle_incoming(&self, msg: ServerMessage, heartbeat_sent: &mut Option<Instant>) {
        if let Err(e) = validate_server_message(&msg) {
            warn!("Discarding invalid server message: {}", e);
            return;
        }

        match &msg {
            ServerMessage::JoinedSession {
                success: true,
                is_host,
                player_id,
                players,
                session,
                ..
            } => {
                let session_id = session
                    .as_ref()
                    .map(|s| s.id.clone())
                    .or_else(|| self.last_join.lock().as_ref().map(|p| p.session_id.clone()));
                if let Some(session_id) = session_id {
                    *self.membership.lock() = Some(Membership {
                        session_id,
                        participant_id: player_id.clone(),
                        is_host: *is_host,
                        roster: players.clone(),
                    });
                }
            }
            ServerMessage::HostChanged { host_id, host_name } => {
                if let Some(m) = self.membership.lock().as_mut() {
                    m.is_host = m.participant_id == *host_id;
                    for p in &mut m.roster {
                        p.is_host = p.id == *host_id;
                    }
                    if m.is_host {
                        info!(session = %m.session_id, "Promoted to host");
                    } else {
                        debug!(session = %m.session_id, host = %host_name, "Host changed");
                    }
                }
            }
            ServerMessage::PlayerJoined { players, .. } | ServerMessage::PlayerLeft { players, .. } => {
                if let Some(m) = self.membership.lock().as_mut() {
                    m.roster = players.clone();
                }
            }
            ServerMessage::SessionError { error } if error == "session expired" => {
                self.membership.lock().take();
                self.last_join.lock().take();
            }
            ServerMessage::HeartbeatAck { .. } => {
                if let Some(sent) = heartbeat_sent.take() {
                    let rtt = sent.elapsed();
                    self.latency_tx.send_replace(Some(rtt));
                }
            }
            _ => {}
        }

        let _ = self.events_tx.send(msg);
    }
}

/// Background task owning the rendezvous link
async fn run_link(
    inner: Arc<Inner>,
    mut link: Box<dyn RendezvousLink>,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
) {
    let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut heartbeat_sent: Option<Instant> = None;

    loop {
        let dropped = tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(msg) => match link.send(&msg).await {
                    Ok(()) => false,
                    Err(e) => {
                        warn!("Send failed: {}", e);
                        true
                    }
                },
                None => {
                    link.close().await;
                    return;
                }
            },
            incoming = link.recv() => match incoming {
                Some(msg) => {
                    inner.handle_incoming(msg, &mut heartbeat_sent);
                    false
                }
                None => true,
            },
            _ = heartbeat.tick() => {
                heartbeat_sent = Some(Instant::now());
                link.send(&ClientMessage::Heartbeat).await.is_err()
            }
        };

        if !dropped {
            continue;
        }

        // Host identity does not survive a reconnect
        warn!("Rendezvous link lost, reconnecting");
        inner.membership.lock().take();
        heartbeat_sent = None;
        inner.set_state(ConnectionState::Reconnecting);

        let policy = inner.config.reconnect_retry.policy();
        match inner.open_link(&policy, false).await {
            Ok(new_link) => {
                link = new_link;
                inner.set_state(ConnectionState::Connected);
                heartbeat.reset();

                let rejoin = inner.last_join.lock().clone();
                if let Some(params) = rejoin {
                    info!(session = %params.session_id, "Rejoining session after reconnect");
                    if let Err(e) = link.send(&params.message()).await {
                        warn!("Rejoin failed: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!("Giving up on rendezvous link: {}", e);
                inner.outbound.lock().take();
                inner.set_state(ConnectionState::Failed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use playlink_core::config::RetryPolicyConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    /// Test double for the server side of one link
    struct ServerEnd {
        from_client: UnboundedReceiver<ClientMessage>,
        to_client: UnboundedSender<ServerMessage>,
    }

    struct ChannelLink {
        to_server: UnboundedSender<ClientMessage>,
        from_server: UnboundedReceiver<ServerMessage>,
    }

    #[async_trait]
    impl RendezvousLink for ChannelLink {
        async fn send(&mut self, msg: &ClientMessage) -> Result<(), SessionError> {
            self.to_server
                .send(msg.clone())
                .map_err(|_| SessionError::TransportDisconnected)
        }

        async fn recv(&mut self) -> Option<ServerMessage> {
            self.from_server.recv().await
        }

        async fn close(&mut self) {}
    }

    /// Hands out links and passes the server ends to the test
    struct ChannelConnector {
        ends: UnboundedSender<ServerEnd>,
        failures_left: AtomicU32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl RendezvousConnector for ChannelConnector {
        async fn connect(&self) -> Result<Box<dyn RendezvousLink>, SessionError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SessionError::Transport("connection refused".into()));
            }
            let (to_server, from_client) = mpsc::unbounded_channel();
            let (to_client, from_server) = mpsc::unbounded_channel();
            let _ = self.ends.send(ServerEnd {
                from_client,
                to_client,
            });
            Ok(Box::new(ChannelLink {
                to_server,
                from_server,
            }))
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_retries,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
        }
    }

    fn client(failures: u32) -> (SessionClient, Arc<ChannelConnector>, UnboundedReceiver<ServerEnd>) {
        let (ends_tx, ends_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(ChannelConnector {
            ends: ends_tx,
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        });
        let mut config = ClientConfig::default();
        config.connect_retry = fast_policy(3);
        config.reconnect_retry = fast_policy(3);
        config.join_timeout_secs = 5;
        let client = SessionClient::new(
            config,
            connector.clone(),
            Arc::new(RetryManager::new()),
            CorrelationId::new(),
        );
        (client, connector, ends_rx)
    }

    fn participant(id: &str, is_host: bool) -> ParticipantInfo {
        ParticipantInfo {
            id: id.into(),
            name: id.to_uppercase(),
            user_id: None,
            is_host,
            joined_at: 0,
        }
    }

    fn ack(player_id: &str, is_host: bool, players: Vec<ParticipantInfo>) -> ServerMessage {
        ServerMessage::JoinedSession {
            success: true,
            is_host,
            player_id: player_id.into(),
            players,
            session: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_emit_before_connect() {
        let (client, _, _) = client(0);
        assert!(!client.send_chat("hello"));
        assert_eq!(
            client.join("room", "A").await.unwrap_err(),
            SessionError::TransportNotInitialized
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_and_reports_progress() {
        let (client, connector, _ends) = client(2);
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        client.set_progress_observer(Arc::new(move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Idempotent
        client.connect().await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_sets_failed() {
        let (client, _, _) = client(10);
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(!client.send_chat("hello"));
    }

    #[tokio::test]
    async fn test_join_success() {
        let (client, _, mut ends) = client(0);
        client.connect().await.unwrap();
        let mut server = ends.recv().await.unwrap();

        let responder = tokio::spawn(async move {
            let msg = server.from_client.recv().await.unwrap();
            assert_eq!(msg.event_name(), "join-session");
            server
                .to_client
                .send(ack("p1", true, vec![participant("p1", true)]))
                .unwrap();
            server
        });

        let membership = client.join("room", "A").await.unwrap();
        assert!(membership.is_host);
        assert_eq!(membership.participant_id, "p1");
        let _server = responder.await.unwrap();

        // Membership is updated by the link task before the event is published
        assert!(client.is_host());
        assert_eq!(client.session_id().as_deref(), Some("room"));
        assert!(client.sync_state(serde_json::json!({"frame": 1})));
    }

    #[tokio::test]
    async fn test_join_rejected() {
        let (client, _, mut ends) = client(0);
        client.connect().await.unwrap();
        let mut server = ends.recv().await.unwrap();

        tokio::spawn(async move {
            server.from_client.recv().await;
            server
                .to_client
                .send(ServerMessage::join_failed("session is full (4 players)"))
                .unwrap();
            server
        });

        let err = client.join("room", "A").await.unwrap_err();
        assert!(err.is_join_failure());
        assert!(matches!(err, SessionError::JoinRejected(_)));
    }

    #[tokio::test]
    async fn test_unrelated_session_error_does_not_reject_join() {
        let (client, _, mut ends) = client(0);
        client.connect().await.unwrap();
        let mut server = ends.recv().await.unwrap();

        let responder = tokio::spawn(async move {
            let msg = server.from_client.recv().await.unwrap();
            assert_eq!(msg.event_name(), "join-session");
            // Reply to an earlier room-info request arrives first
            server
                .to_client
                .send(ServerMessage::error("Session lobby not found"))
                .unwrap();
            server
                .to_client
                .send(ack("p1", true, vec![participant("p1", true)]))
                .unwrap();
            server
        });

        let membership = client.join("room", "A").await.unwrap();
        assert_eq!(membership.participant_id, "p1");
        let _server = responder.await.unwrap();
        assert_eq!(client.session_id().as_deref(), Some("room"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_times_out() {
        let (client, _, mut ends) = client(0);
        client.connect().await.unwrap();
        let _server = ends.recv().await.unwrap();

        let err = client.join("room", "A").await.unwrap_err();
        assert_eq!(err, SessionError::JoinTimeout(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_before_ack_fails_join() {
        let (client, connector, mut ends) = client(0);
        client.connect().await.unwrap();
        let server = ends.recv().await.unwrap();
        // Every reconnect attempt fails
        connector.failures_left.store(100, Ordering::SeqCst);

        let join = client.join("room", "A");
        let drop_server = async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(server);
        };
        let (result, _) = tokio::join!(join, drop_server);

        assert_eq!(result.unwrap_err(), SessionError::TransportDisconnected);
    }

    #[tokio::test]
    async fn test_non_host_skips_sync_state() {
        let (client, _, mut ends) = client(0);
        client.connect().await.unwrap();
        let mut server = ends.recv().await.unwrap();

        tokio::spawn(async move {
            server.from_client.recv().await;
            server
                .to_client
                .send(ack(
                    "p2",
                    false,
                    vec![participant("p1", true), participant("p2", false)],
                ))
                .unwrap();
            server
        });

        client.join("room", "B").await.unwrap();
        assert!(!client.sync_state(serde_json::json!({})));
        assert!(client.send_input("A", "keydown"));
    }

    #[tokio::test]
    async fn test_host_changed_promotes_local_client() {
        let (client, _, mut ends) = client(0);
        client.connect().await.unwrap();
        let mut server = ends.recv().await.unwrap();
        let mut events = client.subscribe();

        let responder = tokio::spawn(async move {
            server.from_client.recv().await;
            server
                .to_client
                .send(ack(
                    "p2",
                    false,
                    vec![participant("p1", true), participant("p2", false)],
                ))
                .unwrap();
            server
        });

        client.join("room", "B").await.unwrap();
        let server = responder.await.unwrap();
        server
            .to_client
            .send(ServerMessage::HostChanged {
                host_id: "p2".into(),
                host_name: "P2".into(),
            })
            .unwrap();

        loop {
            if let ServerMessage::HostChanged { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert!(client.is_host());
        let membership = client.membership().unwrap();
        assert!(membership.roster.iter().find(|p| p.id == "p2").unwrap().is_host);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_rejoins_last_session() {
        let (client, _, mut ends) = client(0);
        client.connect().await.unwrap();
        let mut first = ends.recv().await.unwrap();

        let joined = tokio::spawn(async move {
            first.from_client.recv().await;
            first
                .to_client
                .send(ack("p1", true, vec![participant("p1", true)]))
                .unwrap();
            first
        });
        client.join("room", "A").await.unwrap();
        let first = joined.await.unwrap();

        // Server side drops the link
        drop(first);

        let mut second = ends.recv().await.unwrap();
        let rejoin = second.from_client.recv().await.unwrap();
        assert!(matches!(
            rejoin,
            ClientMessage::JoinSession { ref session_id, .. } if session_id == "room"
        ));
        assert_eq!(client.state(), ConnectionState::Connected);
        // Host flag was cleared by the drop and waits for the new ack
        assert!(!client.is_host());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_publishes_latency() {
        let (client, _, mut ends) = client(0);
        client.connect().await.unwrap();
        let mut server = ends.recv().await.unwrap();
        let mut latency = client.watch_latency();

        let msg = server.from_client.recv().await.unwrap();
        assert_eq!(msg, ClientMessage::Heartbeat);
        tokio::time::sleep(Duration::from_millis(40)).await;
        server
            .to_client
            .send(ServerMessage::HeartbeatAck { timestamp: 0 })
            .unwrap();

        latency.changed().await.unwrap();
        let rtt = latency.borrow().unwrap();
        assert!(rtt >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_disconnect_resets_state() {
        let (client, _, mut ends) = client(0);
        client.connect().await.unwrap();
        let _server = ends.recv().await.unwrap();

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(!client.send_chat("bye"));
    }
}
