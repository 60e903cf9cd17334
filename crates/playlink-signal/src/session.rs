//! Session (room) state for the signal server

use std::time::Duration;

use tokio::time::Instant;

use playlink_core::{now_millis, JoinError, ParticipantInfo, SessionSnapshot, SessionStatus};

/// A room shared by one host and its players
pub struct Session {
    pub id: String,
    pub title: String,
    pub platform: String,
    pub capacity: usize,
    pub status: SessionStatus,

    /// Participants ordered by join time
    participants: Vec<ParticipantInfo>,

    /// Current host participant id
    host_id: Option<String>,

    /// Creation time (unix millis)
    created_at: u64,

    /// Last activity time
    last_activity: Instant,
}

/// Result of removing a participant
#[derive(Debug)]
pub struct Departure {
    pub participant: ParticipantInfo,
    /// Participant promoted to host, if the departing one was host
    pub new_host: Option<ParticipantInfo>,
}

impl Session {
    /// Create an empty session
    pub fn new(id: String, title: String, platform: String, capacity: usize) -> Self {
        Self {
            id,
            title,
            platform,
            capacity: capacity.max(1),
            status: SessionStatus::Waiting,
            participants: Vec::new(),
            host_id: None,
            created_at: now_millis(),
            last_activity: Instant::now(),
        }
    }

    /// Add a participant; the first one in an empty room becomes host
    pub fn add_participant(&mut self, mut info: ParticipantInfo) -> Result<(), JoinError> {
        if self.is_full() {
            return Err(JoinError::SessionFull {
                capacity: self.capacity,
            });
        }

        info.is_host = self.participants.is_empty();
        if info.is_host {
            self.host_id = Some(info.id.clone());
        }
        self.participants.push(info);
        self.touch();
        Ok(())
    }

    /// Remove a participant, promoting the earliest-joined remaining one if
    /// the host left
    pub fn remove_participant(&mut self, participant_id: &str) -> Option<Departure> {
        let index = self
            .participants
            .iter()
            .position(|p| p.id == participant_id)?;
        let participant = self.participants.remove(index);
        self.touch();

        let mut new_host = None;
        if participant.is_host {
            self.host_id = None;
            if let Some(next) = self.participants.first_mut() {
                next.is_host = true;
                self.host_id = Some(next.id.clone());
                new_host = Some(next.clone());
            }
        }

        Some(Departure {
            participant,
            new_host,
        })
    }

    pub fn get(&self, participant_id: &str) -> Option<&ParticipantInfo> {
        self.participants.iter().find(|p| p.id == participant_id)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.get(participant_id).is_some()
    }

    pub fn host(&self) -> Option<&ParticipantInfo> {
        self.host_id.as_deref().and_then(|id| self.get(id))
    }

    pub fn is_host(&self, participant_id: &str) -> bool {
        self.host_id.as_deref() == Some(participant_id)
    }

    /// Roster ordered by join time
    pub fn roster(&self) -> Vec<ParticipantInfo> {
        self.participants.clone()
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.capacity
    }

    /// Check if the session has been idle for longer than `retention`
    pub fn is_idle(&self, retention: Duration) -> bool {
        self.last_activity.elapsed() > retention
    }

    /// Update last activity time
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            platform: self.platform.clone(),
            capacity: self.capacity,
            status: self.status,
            host_id: self.host_id.clone(),
            players: self.roster(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_participant(id: &str) -> ParticipantInfo {
        ParticipantInfo {
            id: id.into(),
            name: id.to_uppercase(),
            user_id: None,
            is_host: false,
            joined_at: now_millis(),
        }
    }

    fn make_session(capacity: usize) -> Session {
        Session::new("room".into(), "Room".into(), "nes".into(), capacity)
    }

    #[test]
    fn test_first_participant_is_host() {
        let mut session = make_session(4);
        assert!(session.host().is_none());

        session.add_participant(make_participant("a")).unwrap();
        session.add_participant(make_participant("b")).unwrap();

        assert_eq!(session.host().unwrap().id, "a");
        assert!(!session.get("b").unwrap().is_host);
        assert_eq!(session.len(), 2);
    }

    #[test]
    fn test_session_full() {
        let mut session = make_session(2);
        session.add_participant(make_participant("a")).unwrap();
        session.add_participant(make_participant("b")).unwrap();

        let err = session.add_participant(make_participant("c")).unwrap_err();
        assert_eq!(err, JoinError::SessionFull { capacity: 2 });
        assert_eq!(session.len(), 2);
    }

    #[test]
    fn test_host_departure_promotes_earliest() {
        let mut session = make_session(4);
        for id in ["a", "b", "c"] {
            session.add_participant(make_participant(id)).unwrap();
        }

        let departure = session.remove_participant("a").unwrap();
        assert!(departure.participant.is_host);
        assert_eq!(departure.new_host.unwrap().id, "b");
        assert!(session.is_host("b"));

        let hosts = session.roster().iter().filter(|p| p.is_host).count();
        assert_eq!(hosts, 1);
    }

    #[test]
    fn test_player_departure_keeps_host() {
        let mut session = make_session(4);
        for id in ["a", "b", "c"] {
            session.add_participant(make_participant(id)).unwrap();
        }

        let departure = session.remove_participant("b").unwrap();
        assert!(departure.new_host.is_none());
        assert!(session.is_host("a"));
        assert_eq!(session.participant_ids(), vec!["a", "c"]);
    }

    #[test]
    fn test_last_departure_empties() {
        let mut session = make_session(4);
        session.add_participant(make_participant("a")).unwrap();
        let departure = session.remove_participant("a").unwrap();
        assert!(departure.new_host.is_none());
        assert!(session.is_empty());
        assert!(session.host().is_none());
        assert!(session.remove_participant("a").is_none());
    }

    #[test]
    fn test_snapshot_matches_roster() {
        let mut session = make_session(4);
        session.add_participant(make_participant("a")).unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.player_count(), session.len());
        assert_eq!(snapshot.host_id.as_deref(), Some("a"));
        assert!(playlink_core::validation::validate_snapshot(&snapshot).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_detection() {
        let mut session = make_session(4);
        assert!(!session.is_idle(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(session.is_idle(Duration::from_secs(60)));

        session.touch();
        assert!(!session.is_idle(Duration::from_secs(60)));
    }
}
