//! Schema checks for inbound messages
//!
//! Messages are validated before they are applied. A failure carries every
//! reason found, not just the first.

use crate::error::ValidationError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::types::SessionSnapshot;
use crate::{MAX_CHAT_LEN, MAX_NAME_LEN, MAX_SESSION_ID_LEN};

const MAX_KEY_LEN: usize = 32;
const MAX_TITLE_LEN: usize = 100;

/// Strip markup characters and script URLs from user-supplied text
pub fn sanitize(input: &str) -> String {
    let mut out: String = input.chars().filter(|c| *c != '<' && *c != '>').collect();
    const SCRIPT: &str = "javascript:";
    while let Some(pos) = out.to_ascii_lowercase().find(SCRIPT) {
        out.replace_range(pos..pos + SCRIPT.len(), "");
    }
    out.trim().to_string()
}

/// Apply [`sanitize`] to every free-text field of a client message
pub fn sanitize_client_message(msg: ClientMessage) -> ClientMessage {
    match msg {
        ClientMessage::JoinSession {
            session_id,
            user_id,
            user_name,
            title,
            platform,
            capacity,
        } => ClientMessage::JoinSession {
            session_id,
            user_id,
            user_name: sanitize(&user_name),
            title: title.map(|t| sanitize(&t)),
            platform: platform.map(|p| sanitize(&p)),
            capacity,
        },
        ClientMessage::ChatMessage { message } => ClientMessage::ChatMessage {
            message: sanitize(&message),
        },
        other => other,
    }
}

#[derive(Default)]
struct Reasons(Vec<String>);

impl Reasons {
    fn check(&mut self, ok: bool, reason: impl FnOnce() -> String) {
        if !ok {
            self.0.push(reason());
        }
    }

    fn session_id(&mut self, field: &str, id: &str) {
        self.check(!id.trim().is_empty(), || format!("{} is required", field));
        self.check(id.chars().count() <= MAX_SESSION_ID_LEN, || {
            format!("{} exceeds {} characters", field, MAX_SESSION_ID_LEN)
        });
        self.check(
            id.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            || format!("{} contains invalid characters", field),
        );
    }

    fn text(&mut self, field: &str, value: &str, max: usize) {
        self.check(!value.trim().is_empty(), || format!("{} is required", field));
        self.check(value.chars().count() <= max, || {
            format!("{} exceeds {} characters", field, max)
        });
    }

    fn finish(self, event: &str) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(event, self.0))
        }
    }
}

/// Validate a message received from a client
pub fn validate_client_message(msg: &ClientMessage) -> Result<(), ValidationError> {
    let mut r = Reasons::default();

    match msg {
        ClientMessage::JoinSession {
            session_id,
            user_name,
            title,
            capacity,
            ..
        } => {
            r.session_id("sessionId", session_id);
            r.text("userName", user_name, MAX_NAME_LEN);
            if let Some(title) = title {
                r.check(title.chars().count() <= MAX_TITLE_LEN, || {
                    format!("title exceeds {} characters", MAX_TITLE_LEN)
                });
            }
            if let Some(capacity) = capacity {
                r.check(*capacity >= 1, || "capacity must be at least 1".into());
            }
        }
        ClientMessage::LeaveSession { session_id }
        | ClientMessage::GetRoomInfo { session_id }
        | ClientMessage::StartSession { session_id } => {
            r.session_id("sessionId", session_id);
        }
        ClientMessage::Input { key, kind, .. } => {
            r.text("key", key, MAX_KEY_LEN);
            r.check(kind == "keydown" || kind == "keyup", || {
                format!("type must be keydown or keyup, got {:?}", kind)
            });
        }
        ClientMessage::SyncState { state, .. } => {
            r.check(!state.is_null(), || "state is required".into());
        }
        ClientMessage::ChatMessage { message } => {
            r.text("message", message, MAX_CHAT_LEN);
        }
        ClientMessage::Heartbeat | ClientMessage::GetLobbySessions => {}
    }

    r.finish(msg.event_name())
}

/// Validate a message received from the rendezvous server
pub fn validate_server_message(msg: &ServerMessage) -> Result<(), ValidationError> {
    let mut r = Reasons::default();

    match msg {
        ServerMessage::JoinedSession {
            success,
            player_id,
            players,
            session,
            error,
            ..
        } => {
            if *success {
                r.check(!player_id.is_empty(), || "playerId is required".into());
                r.check(players.iter().any(|p| &p.id == player_id), || {
                    "players does not include playerId".into()
                });
                if let Some(session) = session {
                    snapshot_reasons(&mut r, session);
                }
            } else {
                r.check(error.is_some(), || "error is required when success is false".into());
            }
        }
        ServerMessage::PlayerJoined { player, players } => {
            r.check(!player.id.is_empty(), || "player.id is required".into());
            r.check(players.iter().any(|p| p.id == player.id), || {
                "players does not include the joined player".into()
            });
        }
        ServerMessage::PlayerLeft { player_id, players } => {
            r.check(!player_id.is_empty(), || "playerId is required".into());
            r.check(players.iter().all(|p| &p.id != player_id), || {
                "players still includes the departed player".into()
            });
        }
        ServerMessage::HostChanged { host_id, .. } => {
            r.check(!host_id.is_empty(), || "hostId is required".into());
        }
        ServerMessage::PlayerInput { player_id, key, .. } => {
            r.check(!player_id.is_empty(), || "playerId is required".into());
            r.check(!key.is_empty(), || "key is required".into());
        }
        ServerMessage::GameState { host_id, .. } => {
            r.check(!host_id.is_empty(), || "hostId is required".into());
        }
        ServerMessage::RoomInfo { session } | ServerMessage::SessionUpdated { session } => {
            snapshot_reasons(&mut r, session);
        }
        ServerMessage::LobbySessions { sessions } => {
            for session in sessions {
                snapshot_reasons(&mut r, session);
            }
        }
        ServerMessage::SessionError { .. }
        | ServerMessage::ChatReceived { .. }
        | ServerMessage::HeartbeatAck { .. } => {}
    }

    r.finish(msg.event_name())
}

/// Validate the invariants of a session snapshot
pub fn validate_snapshot(session: &SessionSnapshot) -> Result<(), ValidationError> {
    let mut r = Reasons::default();
    snapshot_reasons(&mut r, session);
    r.finish("session")
}

fn snapshot_reasons(r: &mut Reasons, s: &SessionSnapshot) {
    r.check(!s.id.is_empty(), || "session id is required".into());
    r.check(s.capacity >= 1, || "capacity must be at least 1".into());
    r.check(s.players.len() <= s.capacity, || {
        format!(
            "session {} has {} players but capacity {}",
            s.id,
            s.players.len(),
            s.capacity
        )
    });

    if !s.players.is_empty() {
        let hosts = s.players.iter().filter(|p| p.is_host).count();
        r.check(hosts == 1, || {
            format!("session {} has {} hosts, expected 1", s.id, hosts)
        });
        let host_matches = s
            .host()
            .map(|h| s.host_id.as_deref() == Some(h.id.as_str()))
            .unwrap_or(false);
        r.check(host_matches, || format!("session {} hostId does not match roster", s.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParticipantInfo, SessionStatus};

    fn participant(id: &str, is_host: bool) -> ParticipantInfo {
        ParticipantInfo {
            id: id.into(),
            name: id.to_uppercase(),
            user_id: None,
            is_host,
            joined_at: 0,
        }
    }

    fn snapshot(players: Vec<ParticipantInfo>, capacity: usize) -> SessionSnapshot {
        SessionSnapshot {
            id: "room".into(),
            title: "Room".into(),
            platform: "nes".into(),
            capacity,
            status: SessionStatus::Waiting,
            host_id: players.iter().find(|p| p.is_host).map(|p| p.id.clone()),
            players,
            created_at: 0,
        }
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("  <b>Alice</b> "), "bAlice/b");
        assert_eq!(sanitize("JavaScript:alert(1)"), "alert(1)");
        assert_eq!(sanitize("javascjavascript:ript:x"), "x");
    }

    #[test]
    fn test_join_requires_name_and_valid_id() {
        let msg = ClientMessage::JoinSession {
            session_id: "bad id!".into(),
            user_id: None,
            user_name: "   ".into(),
            title: None,
            platform: None,
            capacity: Some(0),
        };
        let err = validate_client_message(&msg).unwrap_err();
        assert_eq!(err.event, "join-session");
        assert_eq!(err.reasons.len(), 3);
    }

    #[test]
    fn test_input_type_checked() {
        let ok = ClientMessage::Input {
            key: "ArrowUp".into(),
            kind: "keyup".into(),
            timestamp: 1,
        };
        assert!(validate_client_message(&ok).is_ok());

        let bad = ClientMessage::Input {
            key: "ArrowUp".into(),
            kind: "press".into(),
            timestamp: 1,
        };
        assert!(validate_client_message(&bad).is_err());
    }

    #[test]
    fn test_chat_length_limit() {
        let msg = ClientMessage::ChatMessage {
            message: "x".repeat(MAX_CHAT_LEN + 1),
        };
        assert!(validate_client_message(&msg).is_err());
    }

    #[test]
    fn test_snapshot_invariants() {
        assert!(validate_snapshot(&snapshot(vec![], 4)).is_ok());
        assert!(validate_snapshot(&snapshot(
            vec![participant("a", true), participant("b", false)],
            4
        ))
        .is_ok());

        // Over capacity
        assert!(validate_snapshot(&snapshot(
            vec![participant("a", true), participant("b", false)],
            1
        ))
        .is_err());

        // No host
        assert!(validate_snapshot(&snapshot(vec![participant("a", false)], 4)).is_err());
    }

    #[test]
    fn test_joined_session_must_include_self() {
        let msg = ServerMessage::JoinedSession {
            success: true,
            is_host: true,
            player_id: "a".into(),
            players: vec![participant("b", true)],
            session: None,
            error: None,
        };
        assert!(validate_server_message(&msg).is_err());
        assert!(validate_server_message(&ServerMessage::join_failed("full")).is_ok());
    }

    #[test]
    fn test_sanitize_join() {
        let msg = sanitize_client_message(ClientMessage::JoinSession {
            session_id: "room".into(),
            user_id: None,
            user_name: " <Alice> ".into(),
            title: None,
            platform: None,
            capacity: None,
        });
        match msg {
            ClientMessage::JoinSession { user_name, .. } => assert_eq!(user_name, "Alice"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
