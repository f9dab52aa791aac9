//! Sessions and their in-memory connection projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::metadata::Metadata;

/// One live attachment of one device to the gateway.
///
/// At most one session per device is active at any time; a new
/// registration supersedes the previous session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSession {
    pub id: String,
    pub device_id: String,
    pub session_id: String,
    /// Set once a data stream attaches to the session.
    pub stream_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: Metadata,
    pub is_active: bool,
}

impl DeviceSession {
    pub fn new(device_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            session_id: session_id.into(),
            stream_id: None,
            connected_at: now,
            last_heartbeat: now,
            metadata: Metadata::new(),
            is_active: true,
        }
    }
}

/// In-memory projection of a session plus traffic counters.
///
/// Owned exclusively by the session registry and destroyed when the
/// registry evicts the entry. Readers receive owned copies.
///
/// Invariants: `is_healthy` implies `is_connected`; the supervisor clears
/// both once `now - last_heartbeat` exceeds the heartbeat timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionState {
    pub connection_id: String,
    pub device_id: String,
    pub session_id: String,
    pub stream_id: Option<String>,
    pub is_connected: bool,
    pub is_healthy: bool,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub messages_sent: i64,
    pub messages_received: i64,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    /// Arbitrary per-device metrics reported with heartbeats.
    pub metrics: Metadata,
}

impl ConnectionState {
    /// Fresh state for a newly registered session: connected, healthy, all
    /// counters zeroed.
    pub fn for_session(session: &DeviceSession) -> Self {
        let now = Utc::now();
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            device_id: session.device_id.clone(),
            session_id: session.session_id.clone(),
            stream_id: session.stream_id.clone(),
            is_connected: true,
            is_healthy: true,
            connected_at: now,
            last_seen: now,
            last_heartbeat: now,
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            last_error: None,
            last_error_at: None,
            metrics: Metadata::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_connection_state_is_healthy() {
        let session = DeviceSession::new("d1", "d1-abcd1234");
        let state = ConnectionState::for_session(&session);
        assert!(state.is_connected);
        assert!(state.is_healthy);
        assert_eq!(state.messages_sent, 0);
        assert_eq!(state.session_id, "d1-abcd1234");
    }
}
