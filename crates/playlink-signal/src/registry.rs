//! Session registry: the single authority for membership and host identity
//!
//! Every connection registers an outbox and receives a participant id. All
//! room mutation goes through [`SessionRegistry`]; the per-key `DashMap`
//! locks serialize changes to one room.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use playlink_core::{
    generate_id, now_millis, JoinError, ParticipantInfo, ServerMessage, SessionSnapshot,
    SessionStatus, SignalConfig,
};

use crate::session::Session;

/// Outbound message queue of one connection
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Parameters of a join request
#[derive(Clone, Debug, Default)]
pub struct JoinRequest {
    pub user_id: Option<String>,
    pub user_name: String,
    pub title: Option<String>,
    pub platform: Option<String>,
    pub capacity: Option<usize>,
}

impl JoinRequest {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            ..Default::default()
        }
    }
}

/// Successful join
#[derive(Clone, Debug)]
pub struct JoinOutcome {
    pub is_host: bool,
    pub participant_id: String,
    pub roster: Vec<ParticipantInfo>,
    pub session: SessionSnapshot,
}

impl JoinOutcome {
    /// Acknowledgement sent to the joiner
    pub fn into_message(self) -> ServerMessage {
        ServerMessage::JoinedSession {
            success: true,
            is_host: self.is_host,
            player_id: self.participant_id,
            players: self.roster,
            session: Some(self.session),
            error: None,
        }
    }
}

/// Room membership and host authority
pub struct SessionRegistry {
    /// Sessions by id
    sessions: DashMap<String, Session>,
    /// Participant id to session id
    members: DashMap<String, String>,
    /// Participant id to outbound queue
    outboxes: DashMap<String, Outbox>,
    config: SignalConfig,
}

impl SessionRegistry {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            members: DashMap::new(),
            outboxes: DashMap::new(),
            config,
        }
    }

    /// Register a new connection and return its participant id
    pub fn register_connection(&self, outbox: Outbox) -> String {
        let participant_id = generate_id();
        self.outboxes.insert(participant_id.clone(), outbox);
        debug!(participant = %participant_id, "Connection registered");
        participant_id
    }

    /// Forget a connection, leaving its session if it had one
    pub fn unregister_connection(&self, participant_id: &str) {
        if let Some(session_id) = self.session_of(participant_id) {
            self.leave(&session_id, participant_id);
        }
        self.outboxes.remove(participant_id);
        debug!(participant = %participant_id, "Connection unregistered");
    }

    /// Session the participant currently belongs to
    pub fn session_of(&self, participant_id: &str) -> Option<String> {
        self.members.get(participant_id).map(|s| s.value().clone())
    }

    /// Join `session_id`, creating it if needed
    ///
    /// The first participant of a new session becomes host. A participant
    /// already in this session is re-acknowledged; one in another session
    /// leaves it first.
    pub fn create_or_join(
        &self,
        participant_id: &str,
        session_id: &str,
        request: JoinRequest,
    ) -> Result<JoinOutcome, JoinError> {
        if request.user_name.trim().is_empty() {
            return Err(JoinError::InvalidRequest("userName is required".into()));
        }

        match self.session_of(participant_id) {
            Some(current) if current == session_id => {
                if let Some(session) = self.sessions.get(session_id) {
                    debug!(participant = %participant_id, session = %session_id, "Re-acknowledging membership");
                    return Ok(JoinOutcome {
                        is_host: session.is_host(participant_id),
                        participant_id: participant_id.to_string(),
                        roster: session.roster(),
                        session: session.snapshot(),
                    });
                }
            }
            Some(other) => {
                self.leave(&other, participant_id);
            }
            None => {}
        }

        let participant = ParticipantInfo {
            id: participant_id.to_string(),
            name: request.user_name.clone(),
            user_id: request.user_id.clone(),
            is_host: false,
            joined_at: now_millis(),
        };

        let outcome = {
            let mut session = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| self.new_session(session_id, &request));
            session.add_participant(participant.clone())?;
            JoinOutcome {
                is_host: session.is_host(participant_id),
                participant_id: participant_id.to_string(),
                roster: session.roster(),
                session: session.snapshot(),
            }
        };
        self.members
            .insert(participant_id.to_string(), session_id.to_string());

        info!(
            participant = %participant_id,
            session = %session_id,
            is_host = outcome.is_host,
            players = outcome.roster.len(),
            "Participant joined"
        );

        let player = outcome
            .roster
            .iter()
            .find(|p| p.id == participant_id)
            .cloned()
            .unwrap_or(participant);
        self.broadcast(
            session_id,
            ServerMessage::PlayerJoined {
                player,
                players: outcome.roster.clone(),
            },
            Some(participant_id),
        );

        Ok(outcome)
    }

    fn new_session(&self, session_id: &str, request: &JoinRequest) -> Session {
        let capacity = request
            .capacity
            .map(|c| c.clamp(1, self.config.max_capacity.max(1)))
            .unwrap_or(self.config.default_capacity);
        info!(session = %session_id, capacity, "Session created");
        Session::new(
            session_id.to_string(),
            request
                .title
                .clone()
                .unwrap_or_else(|| format!("{}'s session", request.user_name)),
            request.platform.clone().unwrap_or_default(),
            capacity,
        )
    }

    /// Send `msg` to every member of the session except `except`
    ///
    /// Returns the number of members the message was queued for.
    pub fn broadcast(&self, session_id: &str, msg: ServerMessage, except: Option<&str>) -> usize {
        let targets = match self.sessions.get(session_id) {
            Some(session) => session.participant_ids(),
            None => return 0,
        };

        targets
            .iter()
            .filter(|id| Some(id.as_str()) != except)
            .filter(|id| self.send_to(id, msg.clone()))
            .count()
    }

    /// Queue a message for one participant
    pub fn send_to(&self, participant_id: &str, msg: ServerMessage) -> bool {
        match self.outboxes.get(participant_id) {
            Some(outbox) => outbox.send(msg).is_ok(),
            None => false,
        }
    }

    /// Remove a participant from a session
    ///
    /// Promotes the earliest-joined remaining participant when the host
    /// leaves, notifies the rest, and disposes the session once empty.
    /// Returns false if the participant was not a member.
    pub fn leave(&self, session_id: &str, participant_id: &str) -> bool {
        self.members
            .remove_if(participant_id, |_, s| s == session_id);

        let (departure, roster, empty) = {
            let mut session = match self.sessions.get_mut(session_id) {
                Some(s) => s,
                None => return false,
            };
            let departure = match session.remove_participant(participant_id) {
                Some(d) => d,
                None => return false,
            };
            (departure, session.roster(), session.is_empty())
        };

        info!(
            participant = %participant_id,
            session = %session_id,
            remaining = roster.len(),
            "Participant left"
        );

        if empty {
            self.sessions.remove_if(session_id, |_, s| s.is_empty());
            info!(session = %session_id, "Session removed (empty)");
            return true;
        }

        if let Some(host) = departure.new_host {
            info!(session = %session_id, host = %host.id, "Host migrated");
            self.broadcast(
                session_id,
                ServerMessage::HostChanged {
                    host_id: host.id,
                    host_name: host.name,
                },
                None,
            );
        }

        self.broadcast(
            session_id,
            ServerMessage::PlayerLeft {
                player_id: participant_id.to_string(),
                players: roster,
            },
            None,
        );
        true
    }

    /// Send a full room snapshot to one participant
    pub fn request_state(&self, session_id: &str, participant_id: &str) -> bool {
        let msg = match self.snapshot(session_id) {
            Some(session) => ServerMessage::RoomInfo { session },
            None => ServerMessage::error(format!("Session {} not found", session_id)),
        };
        self.send_to(participant_id, msg)
    }

    /// Relay authoritative state from the host to the rest of the room
    ///
    /// State from anyone but the current host is dropped.
    pub fn relay_state(&self, participant_id: &str, state: serde_json::Value, timestamp: u64) -> bool {
        let Some(session_id) = self.session_of(participant_id) else {
            return false;
        };
        if !self.touch_as_host(&session_id, participant_id) {
            debug!(participant = %participant_id, session = %session_id, "Dropping state from non-host");
            return false;
        }

        self.broadcast(
            &session_id,
            ServerMessage::GameState {
                host_id: participant_id.to_string(),
                state,
                timestamp,
            },
            Some(participant_id),
        );
        true
    }

    /// Relay a player's input to the rest of the room
    pub fn relay_input(&self, participant_id: &str, key: String, kind: String, timestamp: u64) -> bool {
        let Some((session_id, name)) = self.member_name(participant_id) else {
            return false;
        };
        self.broadcast(
            &session_id,
            ServerMessage::PlayerInput {
                player_id: participant_id.to_string(),
                player_name: name,
                key,
                kind,
                timestamp,
            },
            Some(participant_id),
        );
        true
    }

    /// Relay a chat line to the rest of the room
    pub fn relay_chat(&self, participant_id: &str, message: String) -> bool {
        let Some((session_id, name)) = self.member_name(participant_id) else {
            return false;
        };
        self.broadcast(
            &session_id,
            ServerMessage::ChatReceived {
                player_id: participant_id.to_string(),
                player_name: name,
                message,
                timestamp: now_millis(),
            },
            Some(participant_id),
        );
        true
    }

    /// Move a waiting session to playing (host only)
    pub fn start_session(&self, session_id: &str, participant_id: &str) -> bool {
        let snapshot = {
            let mut session = match self.sessions.get_mut(session_id) {
                Some(s) => s,
                None => return false,
            };
            if !session.is_host(participant_id) {
                debug!(participant = %participant_id, session = %session_id, "Dropping start from non-host");
                return false;
            }
            if session.status != SessionStatus::Waiting {
                return false;
            }
            session.status = SessionStatus::Playing;
            session.touch();
            session.snapshot()
        };

        info!(session = %session_id, "Session started");
        self.broadcast(session_id, ServerMessage::SessionUpdated { session: snapshot }, None);
        true
    }

    /// Record activity for the participant's session and build the ack
    pub fn heartbeat(&self, participant_id: &str) -> ServerMessage {
        if let Some(session_id) = self.session_of(participant_id) {
            if let Some(mut session) = self.sessions.get_mut(&session_id) {
                session.touch();
            }
        }
        ServerMessage::HeartbeatAck {
            timestamp: now_millis(),
        }
    }

    /// Remove sessions idle for longer than `retention`
    ///
    /// Remaining members are told the session expired. Returns the number of
    /// sessions removed.
    pub fn sweep(&self, retention: Duration) -> usize {
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.is_idle(retention))
            .map(|s| s.id.clone())
            .collect();

        let mut removed = 0;
        for session_id in idle {
            let Some((_, session)) = self
                .sessions
                .remove_if(&session_id, |_, s| s.is_idle(retention))
            else {
                continue;
            };

            for participant_id in session.participant_ids() {
                self.members.remove_if(&participant_id, |_, s| *s == session_id);
                self.send_to(&participant_id, ServerMessage::error("session expired"));
            }
            removed += 1;
            info!(session = %session_id, "Session removed (idle timeout)");
        }

        if removed > 0 {
            warn!(removed, "Swept idle sessions");
        }
        removed
    }

    /// Sweep with the configured retention window
    pub fn sweep_expired(&self) -> usize {
        self.sweep(self.config.session_retention())
    }

    /// Sessions open for listing (waiting or playing)
    pub fn lobby(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .filter(|s| s.status.is_listed())
            .map(|s| s.snapshot())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Every session, for monitoring
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|s| s.snapshot()).collect()
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(session_id).map(|s| s.snapshot())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn participant_count(&self) -> usize {
        self.sessions.iter().map(|s| s.len()).sum()
    }

    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    fn member_name(&self, participant_id: &str) -> Option<(String, String)> {
        let session_id = self.session_of(participant_id)?;
        let mut session = self.sessions.get_mut(&session_id)?;
        session.touch();
        let name = session.get(participant_id)?.name.clone();
        drop(session);
        Some((session_id, name))
    }

    fn touch_as_host(&self, session_id: &str, participant_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) if session.is_host(participant_id) => {
                session.touch();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(SignalConfig::default())
    }

    fn connect(registry: &SessionRegistry) -> (String, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register_connection(tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn join(registry: &SessionRegistry, pid: &str, session: &str, name: &str) -> JoinOutcome {
        registry
            .create_or_join(pid, session, JoinRequest::new(name))
            .unwrap()
    }

    #[test]
    fn test_first_joiner_is_host() {
        let reg = registry();
        let (a, _rx_a) = connect(&reg);
        let (b, _rx_b) = connect(&reg);

        let first = join(&reg, &a, "room", "A");
        assert!(first.is_host);
        assert_eq!(first.roster.len(), 1);

        let second = join(&reg, &b, "room", "B");
        assert!(!second.is_host);
        assert_eq!(second.roster.len(), 2);
        assert_eq!(reg.participant_count(), 2);
    }

    #[test]
    fn test_capacity_rejects_extra_joiner() {
        let reg = registry();
        let mut request = JoinRequest::new("A");
        request.capacity = Some(2);

        let (a, _ra) = connect(&reg);
        let (b, _rb) = connect(&reg);
        let (c, _rc) = connect(&reg);
        reg.create_or_join(&a, "room", request).unwrap();
        join(&reg, &b, "room", "B");

        let err = reg
            .create_or_join(&c, "room", JoinRequest::new("C"))
            .unwrap_err();
        assert_eq!(err, JoinError::SessionFull { capacity: 2 });
        assert_eq!(reg.snapshot("room").unwrap().players.len(), 2);
        assert!(reg.session_of(&c).is_none());
    }

    #[test]
    fn test_capacity_is_clamped() {
        let reg = registry();
        let (a, _ra) = connect(&reg);
        let mut request = JoinRequest::new("A");
        request.capacity = Some(1000);
        let outcome = reg.create_or_join(&a, "room", request).unwrap();
        assert_eq!(outcome.session.capacity, SignalConfig::default().max_capacity);
    }

    #[test]
    fn test_rejoin_same_session_is_acknowledged() {
        let reg = registry();
        let (a, _ra) = connect(&reg);
        join(&reg, &a, "room", "A");
        let again = join(&reg, &a, "room", "A");
        assert!(again.is_host);
        assert_eq!(again.roster.len(), 1);
    }

    #[test]
    fn test_join_other_session_leaves_first() {
        let reg = registry();
        let (a, _ra) = connect(&reg);
        join(&reg, &a, "one", "A");
        join(&reg, &a, "two", "A");

        assert!(reg.snapshot("one").is_none());
        assert_eq!(reg.session_of(&a).as_deref(), Some("two"));
    }

    #[test]
    fn test_host_leave_promotes_earliest_remaining() {
        let reg = registry();
        let (a, _ra) = connect(&reg);
        let (b, mut rb) = connect(&reg);
        let (c, mut rc) = connect(&reg);
        join(&reg, &a, "room", "A");
        join(&reg, &b, "room", "B");
        join(&reg, &c, "room", "C");
        drain(&mut rb);
        drain(&mut rc);

        assert!(reg.leave("room", &a));

        let snapshot = reg.snapshot("room").unwrap();
        assert_eq!(snapshot.host_id.as_deref(), Some(b.as_str()));
        assert_eq!(snapshot.players.iter().filter(|p| p.is_host).count(), 1);

        for rx in [&mut rb, &mut rc] {
            let msgs = drain(rx);
            assert!(matches!(
                &msgs[0],
                ServerMessage::HostChanged { host_id, host_name } if *host_id == b && host_name == "B"
            ));
            assert!(matches!(
                &msgs[1],
                ServerMessage::PlayerLeft { player_id, players } if *player_id == a && players.len() == 2
            ));
        }
    }

    #[test]
    fn test_player_leave_keeps_host() {
        let reg = registry();
        let (a, mut ra) = connect(&reg);
        let (b, _rb) = connect(&reg);
        join(&reg, &a, "room", "A");
        join(&reg, &b, "room", "B");
        drain(&mut ra);

        reg.leave("room", &b);

        assert_eq!(reg.snapshot("room").unwrap().host_id.as_deref(), Some(a.as_str()));
        let msgs = drain(&mut ra);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], ServerMessage::PlayerLeft { .. }));
    }

    #[test]
    fn test_empty_session_disposed() {
        let reg = registry();
        let (a, _ra) = connect(&reg);
        join(&reg, &a, "room", "A");
        reg.unregister_connection(&a);

        assert_eq!(reg.session_count(), 0);
        assert_eq!(reg.connection_count(), 0);
        assert!(!reg.leave("room", &a));
    }

    #[test]
    fn test_host_migration_scenario() {
        // A creates, B joins, A drops, C joins
        let reg = registry();
        let (a, _ra) = connect(&reg);
        let (b, mut rb) = connect(&reg);
        let (c, _rc) = connect(&reg);

        join(&reg, &a, "room", "A");
        join(&reg, &b, "room", "B");
        drain(&mut rb);

        reg.unregister_connection(&a);
        let msgs = drain(&mut rb);
        assert!(matches!(&msgs[0], ServerMessage::HostChanged { host_id, .. } if *host_id == b));

        let outcome = join(&reg, &c, "room", "C");
        assert!(!outcome.is_host);
        let ids: Vec<_> = outcome.roster.iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec![b.clone(), c.clone()]);
        assert!(outcome.roster[0].is_host);
    }

    #[test]
    fn test_state_from_non_host_dropped() {
        let reg = registry();
        let (a, mut ra) = connect(&reg);
        let (b, mut rb) = connect(&reg);
        join(&reg, &a, "room", "A");
        join(&reg, &b, "room", "B");
        drain(&mut ra);
        drain(&mut rb);

        assert!(!reg.relay_state(&b, serde_json::json!({"frame": 1}), 1));
        assert!(drain(&mut ra).is_empty());

        assert!(reg.relay_state(&a, serde_json::json!({"frame": 2}), 2));
        let msgs = drain(&mut rb);
        assert!(matches!(&msgs[0], ServerMessage::GameState { host_id, .. } if *host_id == a));
        assert!(drain(&mut ra).is_empty());
    }

    #[test]
    fn test_input_and_chat_exclude_origin() {
        let reg = registry();
        let (a, mut ra) = connect(&reg);
        let (b, mut rb) = connect(&reg);
        join(&reg, &a, "room", "A");
        join(&reg, &b, "room", "B");
        drain(&mut ra);

        reg.relay_input(&b, "ArrowUp".into(), "keydown".into(), 5);
        reg.relay_chat(&b, "hi".into());

        let msgs = drain(&mut ra);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(&msgs[0], ServerMessage::PlayerInput { player_name, key, .. } if player_name == "B" && key == "ArrowUp"));
        assert!(matches!(&msgs[1], ServerMessage::ChatReceived { message, .. } if message == "hi"));
        assert!(drain(&mut rb).is_empty());
    }

    #[test]
    fn test_start_session_host_only() {
        let reg = registry();
        let (a, _ra) = connect(&reg);
        let (b, mut rb) = connect(&reg);
        join(&reg, &a, "room", "A");
        join(&reg, &b, "room", "B");
        drain(&mut rb);

        assert!(!reg.start_session("room", &b));
        assert_eq!(reg.snapshot("room").unwrap().status, SessionStatus::Waiting);

        assert!(reg.start_session("room", &a));
        assert_eq!(reg.snapshot("room").unwrap().status, SessionStatus::Playing);
        assert!(matches!(drain(&mut rb)[0], ServerMessage::SessionUpdated { .. }));
    }

    #[test]
    fn test_request_state_unicasts_snapshot() {
        let reg = registry();
        let (a, mut ra) = connect(&reg);
        join(&reg, &a, "room", "A");

        assert!(reg.request_state("room", &a));
        assert!(matches!(drain(&mut ra).pop(), Some(ServerMessage::RoomInfo { .. })));

        reg.request_state("missing", &a);
        assert!(matches!(drain(&mut ra).pop(), Some(ServerMessage::SessionError { .. })));
    }

    #[test]
    fn test_lobby_lists_open_sessions() {
        let reg = registry();
        let (a, _ra) = connect(&reg);
        let (b, _rb) = connect(&reg);
        join(&reg, &a, "one", "A");
        join(&reg, &b, "two", "B");
        reg.start_session("two", &b);

        assert_eq!(reg.lobby().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_idle_sessions() {
        let reg = registry();
        let (a, mut ra) = connect(&reg);
        let (b, _rb) = connect(&reg);
        join(&reg, &a, "old", "A");

        tokio::time::advance(Duration::from_secs(30)).await;
        join(&reg, &b, "fresh", "B");
        tokio::time::advance(Duration::from_secs(40)).await;

        assert_eq!(reg.sweep(Duration::from_secs(60)), 1);
        assert!(reg.snapshot("old").is_none());
        assert!(reg.snapshot("fresh").is_some());
        assert!(reg.session_of(&a).is_none());

        let msgs = drain(&mut ra);
        assert!(matches!(msgs.last(), Some(ServerMessage::SessionError { error }) if error == "session expired"));
    }

    #[test]
    fn test_heartbeat_ack() {
        let reg = registry();
        let (a, _ra) = connect(&reg);
        assert!(matches!(reg.heartbeat(&a), ServerMessage::HeartbeatAck { .. }));
    }
}
