//! Composite device status: durable record ⋈ registry entry ⋈ open alerts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use labgw_core::model::{
    validate_device_id, Alert, AlertSeverity, ConnectionState, Device, DeviceStatus,
};
use labgw_core::{GatewayError, GatewayResult, OpContext};
use labgw_proto::convert::timestamp_to_wire;
use labgw_proto::wire::{self, GetDeviceStatusRequest, GetDeviceStatusResponse, HealthStatus};
use labgw_storage::{AlertFilter, Filter, RepositoryManager};
use tracing::warn;

use crate::registry::SessionRegistry;

/// Registry absent: a device unseen for this long is reported offline.
const OFFLINE_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// Registry present but disconnected: seen more recently than this is
/// reported as still connecting.
const DISCONNECT_THRESHOLD: Duration = Duration::from_secs(30);

pub struct StatusHandler {
    repos: Arc<dyn RepositoryManager>,
    registry: Arc<SessionRegistry>,
}

pub fn validate_request(req: &GetDeviceStatusRequest) -> GatewayResult<()> {
    validate_device_id(&req.device_id)
}

impl StatusHandler {
    pub fn new(repos: Arc<dyn RepositoryManager>, registry: Arc<SessionRegistry>) -> Self {
        Self { repos, registry }
    }

    pub async fn get_device_status(
        &self,
        ctx: &OpContext,
        req: GetDeviceStatusRequest,
    ) -> GatewayResult<GetDeviceStatusResponse> {
        let device = self
            .repos
            .device()
            .get_by_id(ctx, &req.device_id)
            .await?
            .ok_or(GatewayError::NotFound("device"))?;

        let connection = self.registry.get(&req.device_id).await;

        // Recent unresolved alerts of severity >= error color health.
        let alert_filter = AlertFilter {
            filter: Filter {
                limit: 10,
                ..Filter::default()
            },
            device_ids: vec![req.device_id.clone()],
            severities: vec![AlertSeverity::Error, AlertSeverity::Critical],
            resolved: Some(false),
            ..AlertFilter::default()
        };
        let alerts = match self.repos.alert().list(ctx, &alert_filter).await {
            Ok(alerts) => alerts,
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                // Status stays serviceable without alert coloring.
                warn!(device_id = %req.device_id, error = %err, "failed to load device alerts");
                Vec::new()
            }
        };

        let effective = effective_status(&device, connection.as_ref());
        let health = health_status(
            &device,
            connection.as_ref(),
            &alerts,
            self.registry.heartbeat_timeout(),
        );

        Ok(GetDeviceStatusResponse {
            device_id: req.device_id,
            status: wire::DeviceStatus::from(effective) as i32,
            last_seen: device.last_seen.map(timestamp_to_wire),
            metadata: status_metadata(&device, connection.as_ref()),
            active_capabilities: active_capabilities(&device, connection.as_ref()),
            health: health as i32,
        })
    }
}

/// Derive the status reported to callers.
///
/// Precedence: live registry state wins over the durable record; a
/// durable record with no registry entry decays to `offline` once
/// `last_seen` is stale.
pub fn effective_status(device: &Device, connection: Option<&ConnectionState>) -> DeviceStatus {
    let now = Utc::now();
    match connection {
        None => {
            if let Some(last_seen) = device.last_seen {
                let threshold = chrono::Duration::from_std(OFFLINE_THRESHOLD)
                    .unwrap_or_else(|_| chrono::Duration::minutes(5));
                if now - last_seen > threshold {
                    return DeviceStatus::Offline;
                }
            }
            device.status
        }
        Some(conn) if conn.is_connected => {
            if conn.is_healthy {
                DeviceStatus::Online
            } else {
                DeviceStatus::Error
            }
        }
        Some(conn) => {
            let threshold = chrono::Duration::from_std(DISCONNECT_THRESHOLD)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
            if now - conn.last_seen < threshold {
                DeviceStatus::Connecting
            } else {
                DeviceStatus::Offline
            }
        }
    }
}

/// `SERVING` unless the device, its connection, its alerts, or its
/// heartbeat say otherwise.
pub fn health_status(
    device: &Device,
    connection: Option<&ConnectionState>,
    alerts: &[Alert],
    heartbeat_timeout: Duration,
) -> HealthStatus {
    if matches!(device.status, DeviceStatus::Error | DeviceStatus::Offline) {
        return HealthStatus::HealthNotServing;
    }
    if let Some(conn) = connection {
        if !conn.is_healthy {
            return HealthStatus::HealthNotServing;
        }
        let cutoff = chrono::Duration::from_std(heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        if Utc::now() - conn.last_heartbeat > cutoff {
            return HealthStatus::HealthNotServing;
        }
    }
    if alerts.iter().any(|a| a.is_critical() && !a.is_resolved()) {
        return HealthStatus::HealthNotServing;
    }
    HealthStatus::HealthServing
}

/// Declared capabilities are active only while the connection is both
/// present and healthy.
pub fn active_capabilities(device: &Device, connection: Option<&ConnectionState>) -> Vec<String> {
    match connection {
        Some(conn) if conn.is_connected && conn.is_healthy => device.capabilities.clone(),
        _ => Vec::new(),
    }
}

/// Response metadata: device metadata plus connection facts and counters.
fn status_metadata(
    device: &Device,
    connection: Option<&ConnectionState>,
) -> std::collections::HashMap<String, String> {
    let mut metadata: std::collections::HashMap<String, String> = device
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.as_display_string()))
        .collect();

    metadata.insert("device_type".into(), device.device_type.clone());
    metadata.insert("firmware_version".into(), device.version.clone());
    metadata.insert("registered_at".into(), device.registered_at.to_rfc3339());
    metadata.insert("updated_at".into(), device.updated_at.to_rfc3339());

    if let Some(conn) = connection {
        metadata.insert("connection_id".into(), conn.connection_id.clone());
        metadata.insert("session_id".into(), conn.session_id.clone());
        metadata.insert("connected_at".into(), conn.connected_at.to_rfc3339());
        metadata.insert("last_heartbeat".into(), conn.last_heartbeat.to_rfc3339());
        metadata.insert("is_connected".into(), conn.is_connected.to_string());
        metadata.insert("is_healthy".into(), conn.is_healthy.to_string());
        metadata.insert("messages_sent".into(), conn.messages_sent.to_string());
        metadata.insert(
            "messages_received".into(),
            conn.messages_received.to_string(),
        );
        metadata.insert("bytes_sent".into(), conn.bytes_sent.to_string());
        metadata.insert("bytes_received".into(), conn.bytes_received.to_string());
        for (key, value) in &conn.metrics {
            metadata.insert(format!("metric_{key}"), value.as_display_string());
        }
        if let Some(last_error) = &conn.last_error {
            metadata.insert("last_error".into(), last_error.clone());
            if let Some(at) = conn.last_error_at {
                metadata.insert("last_error_at".into(), at.to_rfc3339());
            }
        }
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use labgw_core::model::{AlertType, DeviceSession, Metadata};

    fn device(status: DeviceStatus) -> Device {
        let now = Utc::now();
        Device {
            id: "d1".into(),
            name: "Device One".into(),
            device_type: "sensor".into(),
            version: "1.0".into(),
            status,
            metadata: Metadata::new(),
            capabilities: vec!["temperature".into()],
            last_seen: Some(now),
            registered_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn connection(connected: bool, healthy: bool) -> ConnectionState {
        let session = DeviceSession::new("d1", "d1-abcd1234");
        let mut conn = ConnectionState::for_session(&session);
        conn.is_connected = connected;
        conn.is_healthy = healthy;
        conn
    }

    #[test]
    fn test_no_registry_recent_device_keeps_status() {
        let device = device(DeviceStatus::Maintenance);
        assert_eq!(effective_status(&device, None), DeviceStatus::Maintenance);
    }

    #[test]
    fn test_no_registry_stale_device_is_offline() {
        let mut device = device(DeviceStatus::Online);
        device.last_seen = Some(Utc::now() - chrono::Duration::minutes(10));
        assert_eq!(effective_status(&device, None), DeviceStatus::Offline);
    }

    #[test]
    fn test_connected_healthy_is_online() {
        let device = device(DeviceStatus::Connecting);
        let conn = connection(true, true);
        assert_eq!(effective_status(&device, Some(&conn)), DeviceStatus::Online);
    }

    #[test]
    fn test_connected_unhealthy_is_error() {
        let device = device(DeviceStatus::Online);
        let conn = connection(true, false);
        assert_eq!(effective_status(&device, Some(&conn)), DeviceStatus::Error);
    }

    #[test]
    fn test_recently_disconnected_is_connecting() {
        let device = device(DeviceStatus::Online);
        let conn = connection(false, false);
        assert_eq!(
            effective_status(&device, Some(&conn)),
            DeviceStatus::Connecting
        );
    }

    #[test]
    fn test_long_disconnected_is_offline() {
        let device = device(DeviceStatus::Online);
        let mut conn = connection(false, false);
        conn.last_seen = Utc::now() - chrono::Duration::minutes(2);
        assert_eq!(effective_status(&device, Some(&conn)), DeviceStatus::Offline);
    }

    #[test]
    fn test_health_serving_when_all_clear() {
        let device = device(DeviceStatus::Online);
        let conn = connection(true, true);
        let health = health_status(&device, Some(&conn), &[], Duration::from_secs(120));
        assert_eq!(health, HealthStatus::HealthServing);
    }

    #[test]
    fn test_health_not_serving_on_critical_alert() {
        let device = device(DeviceStatus::Online);
        let conn = connection(true, true);
        let alert = Alert::new(
            Some("d1".into()),
            AlertType::DeviceError,
            AlertSeverity::Critical,
            "sensor fault",
        );
        let health = health_status(&device, Some(&conn), &[alert], Duration::from_secs(120));
        assert_eq!(health, HealthStatus::HealthNotServing);
    }

    #[test]
    fn test_health_not_serving_on_stale_heartbeat() {
        let device = device(DeviceStatus::Online);
        let mut conn = connection(true, true);
        conn.last_heartbeat = Utc::now() - chrono::Duration::minutes(5);
        let health = health_status(&device, Some(&conn), &[], Duration::from_secs(120));
        assert_eq!(health, HealthStatus::HealthNotServing);
    }

    #[test]
    fn test_resolved_critical_alert_does_not_color_health() {
        let device = device(DeviceStatus::Online);
        let conn = connection(true, true);
        let mut alert = Alert::new(
            Some("d1".into()),
            AlertType::DeviceError,
            AlertSeverity::Critical,
            "sensor fault",
        );
        alert.resolve();
        let health = health_status(&device, Some(&conn), &[alert], Duration::from_secs(120));
        assert_eq!(health, HealthStatus::HealthServing);
    }

    #[test]
    fn test_active_capabilities_follow_connection_health() {
        let device = device(DeviceStatus::Online);
        assert!(active_capabilities(&device, None).is_empty());
        assert!(active_capabilities(&device, Some(&connection(true, false))).is_empty());
        assert_eq!(
            active_capabilities(&device, Some(&connection(true, true))),
            vec!["temperature".to_string()]
        );
    }
}
