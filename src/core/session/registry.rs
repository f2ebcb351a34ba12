use dashmap::DashMap;

use super::SessionSnapshot;
use crate::errors::BridgeError;

/// Live sessions keyed by connection id.
///
/// Each media handler owns its [`Session`](super::Session) outright and
/// publishes a snapshot here after handling an event, so readers never
/// contend with the audio path.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionSnapshot>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the snapshot for a connection.
    pub fn publish(&self, snapshot: SessionSnapshot) {
        self.sessions.insert(snapshot.connection_id.clone(), snapshot);
    }

    pub fn remove(&self, connection_id: &str) -> Option<SessionSnapshot> {
        self.sessions.remove(connection_id).map(|(_, snapshot)| snapshot)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by(|a, b| {
            a.started_at_secs
                .cmp(&b.started_at_secs)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
        sessions
    }

    /// Look a session up by provider stream id or by connection id.
    pub fn find(&self, id: &str) -> Result<SessionSnapshot, BridgeError> {
        if let Some(snapshot) = self.sessions.get(id) {
            return Ok(snapshot.value().clone());
        }
        self.sessions
            .iter()
            .find(|entry| entry.value().stream_sid.as_deref() == Some(id))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BridgeError::SessionNotFound(id.to_string()))
    }
}
