//! Session Registry: the in-memory index of live device connections.
//!
//! One `RwLock` serializes all access to the two maps (device id ->
//! connection state, session id -> session). Readers take shared mode and
//! get owned copies back, so no caller can observe or produce a torn
//! state. Lock hold times are bounded and never span I/O; the supervisor
//! collects affected device ids under the lock and performs persistence
//! work after releasing it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use labgw_core::model::{ConnectionState, DeviceSession, Metadata};
use labgw_core::{GatewayError, GatewayResult};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct RegistryState {
    /// Keyed by device id; at most one entry per device.
    connections: HashMap<String, ConnectionState>,
    /// Keyed by session id.
    sessions: HashMap<String, DeviceSession>,
}

/// Aggregate counters returned by [`SessionRegistry::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub total_sessions: usize,
    pub total_messages_sent: i64,
    pub total_messages_received: i64,
    pub total_bytes_sent: i64,
    pub total_bytes_received: i64,
}

/// Process-local map from device identity to live connection state.
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
    heartbeat_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                connections: HashMap::new(),
                sessions: HashMap::new(),
            }),
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Allocate a session id for a device: `<device-id>-<8 hex chars>`.
    pub fn generate_session_id(&self, device_id: &str) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{device_id}-{}", &suffix[..8])
    }

    /// Admit a session, unconditionally superseding any existing entry for
    /// the same device id. Returns the superseded session, if any, so the
    /// caller can deactivate its durable row.
    pub async fn register(&self, session: DeviceSession) -> Option<DeviceSession> {
        let mut state = self.state.write().await;

        let old_session_id = state
            .connections
            .get(&session.device_id)
            .map(|conn| conn.session_id.clone());
        let superseded = old_session_id.and_then(|old_session_id| {
            let mut old = state.sessions.remove(&old_session_id)?;
            old.is_active = false;
            Some(old)
        });

        let connection = ConnectionState::for_session(&session);
        info!(
            device_id = %session.device_id,
            session_id = %session.session_id,
            connection_id = %connection.connection_id,
            superseded = superseded.is_some(),
            "device connection registered"
        );
        state
            .connections
            .insert(session.device_id.clone(), connection);
        state
            .sessions
            .insert(session.session_id.clone(), session);

        superseded
    }

    /// Refresh a device's heartbeat, optionally merging reported metrics.
    pub async fn update_heartbeat(
        &self,
        device_id: &str,
        metrics: Option<Metadata>,
    ) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        let conn = state
            .connections
            .get_mut(device_id)
            .ok_or(GatewayError::NotFound("connection"))?;

        let now = Utc::now();
        conn.last_heartbeat = now;
        conn.last_seen = now;
        conn.is_healthy = true;
        if let Some(metrics) = metrics {
            conn.metrics.extend(metrics);
        }
        let session_id = conn.session_id.clone();
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.last_heartbeat = now;
        }
        debug!(device_id, "device heartbeat updated");
        Ok(())
    }

    /// Accumulate traffic counters for a device.
    pub async fn update_stats(
        &self,
        device_id: &str,
        messages_sent: i64,
        messages_received: i64,
        bytes_sent: i64,
        bytes_received: i64,
    ) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        let conn = state
            .connections
            .get_mut(device_id)
            .ok_or(GatewayError::NotFound("connection"))?;
        conn.messages_sent += messages_sent;
        conn.messages_received += messages_received;
        conn.bytes_sent += bytes_sent;
        conn.bytes_received += bytes_received;
        conn.last_seen = Utc::now();
        Ok(())
    }

    /// Record a connection-level error; marks the entry unhealthy.
    pub async fn record_error(&self, device_id: &str, message: &str) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        let conn = state
            .connections
            .get_mut(device_id)
            .ok_or(GatewayError::NotFound("connection"))?;
        conn.last_error = Some(message.to_string());
        conn.last_error_at = Some(Utc::now());
        conn.is_healthy = false;
        warn!(device_id, error = message, "connection error recorded");
        Ok(())
    }

    /// Mark a device disconnected. The entry stays in the registry (for
    /// the status service) until the supervisor evicts it.
    pub async fn disconnect(&self, device_id: &str, reason: &str) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        let conn = state
            .connections
            .get_mut(device_id)
            .ok_or(GatewayError::NotFound("connection"))?;
        conn.is_connected = false;
        conn.is_healthy = false;
        conn.last_seen = Utc::now();
        if !reason.is_empty() {
            conn.last_error = Some(reason.to_string());
            conn.last_error_at = Some(Utc::now());
        }
        let session_id = conn.session_id.clone();
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.is_active = false;
        }
        info!(device_id, reason, "device disconnected");
        Ok(())
    }

    /// Record the stream id on both the connection and its session.
    pub async fn attach_stream(&self, device_id: &str, stream_id: &str) -> GatewayResult<String> {
        let mut state = self.state.write().await;
        let conn = state
            .connections
            .get_mut(device_id)
            .ok_or(GatewayError::NotFound("connection"))?;
        conn.stream_id = Some(stream_id.to_string());
        let session_id = conn.session_id.clone();
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.stream_id = Some(stream_id.to_string());
        }
        Ok(session_id)
    }

    /// Copy of one device's connection state.
    pub async fn get(&self, device_id: &str) -> Option<ConnectionState> {
        let state = self.state.read().await;
        state.connections.get(device_id).cloned()
    }

    /// Copies of all connected entries, keyed by device id.
    pub async fn all_active(&self) -> HashMap<String, ConnectionState> {
        let state = self.state.read().await;
        state
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_connected)
            .map(|(id, conn)| (id.clone(), conn.clone()))
            .collect()
    }

    pub async fn count_active(&self) -> usize {
        let state = self.state.read().await;
        state
            .connections
            .values()
            .filter(|conn| conn.is_connected)
            .count()
    }

    /// Copy of a session by its id.
    pub async fn get_session(&self, session_id: &str) -> Option<DeviceSession> {
        let state = self.state.read().await;
        state.sessions.get(session_id).cloned()
    }

    pub async fn stats(&self) -> RegistryStats {
        let state = self.state.read().await;
        let mut stats = RegistryStats {
            total_connections: state.connections.len(),
            total_sessions: state.sessions.len(),
            ..RegistryStats::default()
        };
        for conn in state.connections.values() {
            if conn.is_connected {
                stats.active_connections += 1;
            }
            stats.total_messages_sent += conn.messages_sent;
            stats.total_messages_received += conn.messages_received;
            stats.total_bytes_sent += conn.bytes_sent;
            stats.total_bytes_received += conn.bytes_received;
        }
        stats
    }

    /// One supervisor sweep over the registry, entirely under the lock but
    /// with no I/O: demote entries past the heartbeat timeout and evict
    /// entries stale past `stale_horizon`. Returns `(demoted device ids,
    /// evicted sessions)` for the caller to reconcile with persistence.
    pub async fn sweep(&self, stale_horizon: Duration) -> (Vec<String>, Vec<DeviceSession>) {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let heartbeat_cutoff = chrono::Duration::from_std(self.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let stale_cutoff = chrono::Duration::from_std(stale_horizon)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut demoted = Vec::new();
        let mut stale = Vec::new();
        for (device_id, conn) in state.connections.iter_mut() {
            if now - conn.last_heartbeat > heartbeat_cutoff {
                if conn.is_connected {
                    conn.is_connected = false;
                    conn.is_healthy = false;
                    demoted.push(device_id.clone());
                }
                if now - conn.last_seen > stale_cutoff {
                    stale.push(device_id.clone());
                }
            }
        }

        let mut evicted_sessions = Vec::new();
        for device_id in &stale {
            if let Some(conn) = state.connections.remove(device_id) {
                if let Some(mut session) = state.sessions.remove(&conn.session_id) {
                    session.is_active = false;
                    evicted_sessions.push(session);
                }
            }
        }

        if !demoted.is_empty() || !evicted_sessions.is_empty() {
            debug!(
                demoted = demoted.len(),
                evicted = evicted_sessions.len(),
                "registry sweep completed"
            );
        }
        (demoted, evicted_sessions)
    }

    /// Clear all in-memory state. Called during graceful shutdown.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        state.connections.clear();
        state.sessions.clear();
        info!("session registry closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(120))
    }

    fn session_for(registry: &SessionRegistry, device_id: &str) -> DeviceSession {
        let session_id = registry.generate_session_id(device_id);
        DeviceSession::new(device_id, session_id)
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = registry();
        let session = session_for(&registry, "d1");
        let session_id = session.session_id.clone();

        assert!(registry.register(session).await.is_none());

        let conn = registry.get("d1").await.unwrap();
        assert!(conn.is_connected);
        assert!(conn.is_healthy);
        assert_eq!(conn.session_id, session_id);
        assert_eq!(registry.count_active().await, 1);
        assert!(registry.get_session(&session_id).await.is_some());
    }

    #[tokio::test]
    async fn test_session_id_shape() {
        let registry = registry();
        let id = registry.generate_session_id("spec-001");
        let suffix = id.strip_prefix("spec-001-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_register_supersedes_previous_session() {
        let registry = registry();
        let first = session_for(&registry, "d1");
        let first_id = first.session_id.clone();
        registry.register(first).await;

        let second = session_for(&registry, "d1");
        let second_id = second.session_id.clone();
        let superseded = registry.register(second).await.unwrap();

        assert_eq!(superseded.session_id, first_id);
        assert!(!superseded.is_active);
        // Only the new session remains indexed.
        assert!(registry.get_session(&first_id).await.is_none());
        assert!(registry.get_session(&second_id).await.is_some());
        assert_eq!(registry.count_active().await, 1);
        assert_eq!(registry.get("d1").await.unwrap().session_id, second_id);
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let registry = registry();
        registry.register(session_for(&registry, "d1")).await;
        registry.update_stats("d1", 3, 5, 300, 500).await.unwrap();
        registry.update_stats("d1", 1, 0, 100, 0).await.unwrap();

        let conn = registry.get("d1").await.unwrap();
        assert_eq!(conn.messages_sent, 4);
        assert_eq!(conn.messages_received, 5);
        assert_eq!(conn.bytes_sent, 400);
        assert_eq!(conn.bytes_received, 500);

        let stats = registry.stats().await;
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.total_messages_sent, 4);
    }

    #[tokio::test]
    async fn test_returned_state_is_a_copy() {
        let registry = registry();
        registry.register(session_for(&registry, "d1")).await;

        let mut copy = registry.get("d1").await.unwrap();
        copy.messages_sent = 9999;
        assert_eq!(registry.get("d1").await.unwrap().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_record_error_marks_unhealthy() {
        let registry = registry();
        registry.register(session_for(&registry, "d1")).await;
        registry.record_error("d1", "frame decode failed").await.unwrap();

        let conn = registry.get("d1").await.unwrap();
        assert!(!conn.is_healthy);
        assert!(conn.is_connected);
        assert_eq!(conn.last_error.as_deref(), Some("frame decode failed"));
        assert!(conn.last_error_at.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_entry_until_sweep() {
        let registry = registry();
        registry.register(session_for(&registry, "d1")).await;
        registry.disconnect("d1", "stream closed").await.unwrap();

        let conn = registry.get("d1").await.unwrap();
        assert!(!conn.is_connected);
        assert!(!conn.is_healthy);
        assert_eq!(registry.count_active().await, 0);
        assert!(registry.all_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_restores_health() {
        let registry = registry();
        registry.register(session_for(&registry, "d1")).await;
        registry.record_error("d1", "glitch").await.unwrap();
        assert!(!registry.get("d1").await.unwrap().is_healthy);

        registry.update_heartbeat("d1", None).await.unwrap();
        assert!(registry.get("d1").await.unwrap().is_healthy);
    }

    #[tokio::test]
    async fn test_sweep_demotes_stale_heartbeats() {
        let registry = SessionRegistry::new(Duration::from_millis(10));
        registry.register(session_for(&registry, "d1")).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let (demoted, evicted) = registry.sweep(Duration::from_secs(3600)).await;
        assert_eq!(demoted, vec!["d1".to_string()]);
        assert!(evicted.is_empty());

        let conn = registry.get("d1").await.unwrap();
        assert!(!conn.is_connected);
        assert!(!conn.is_healthy);

        // A second sweep does not demote again.
        let (demoted, _) = registry.sweep(Duration::from_secs(3600)).await;
        assert!(demoted.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_evicts_long_stale_entries() {
        let registry = SessionRegistry::new(Duration::from_millis(5));
        let session = session_for(&registry, "d1");
        let session_id = session.session_id.clone();
        registry.register(session).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let (_, evicted) = registry.sweep(Duration::from_millis(10)).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].session_id, session_id);
        assert!(!evicted[0].is_active);
        assert!(registry.get("d1").await.is_none());
        assert!(registry.get_session(&session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_device_errors() {
        let registry = registry();
        assert!(registry.update_heartbeat("nope", None).await.is_err());
        assert!(registry.update_stats("nope", 1, 1, 1, 1).await.is_err());
        assert!(registry.disconnect("nope", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_close_clears_state() {
        let registry = registry();
        registry.register(session_for(&registry, "d1")).await;
        registry.close().await;
        assert!(registry.get("d1").await.is_none());
        assert_eq!(registry.stats().await.total_sessions, 0);
    }
}
