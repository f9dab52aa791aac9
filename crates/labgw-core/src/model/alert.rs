//! Operational alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::model::metadata::Metadata;

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(AlertSeverity::Info),
            "warning" => Some(AlertSeverity::Warning),
            "error" => Some(AlertSeverity::Error),
            "critical" => Some(AlertSeverity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    DeviceOffline,
    DeviceError,
    CommandTimeout,
    DataQuality,
    SystemHealth,
    SecurityBreach,
    Performance,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::DeviceOffline => "device_offline",
            AlertType::DeviceError => "device_error",
            AlertType::CommandTimeout => "command_timeout",
            AlertType::DataQuality => "data_quality",
            AlertType::SystemHealth => "system_health",
            AlertType::SecurityBreach => "security_breach",
            AlertType::Performance => "performance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "device_offline" => Some(AlertType::DeviceOffline),
            "device_error" => Some(AlertType::DeviceError),
            "command_timeout" => Some(AlertType::CommandTimeout),
            "data_quality" => Some(AlertType::DataQuality),
            "system_health" => Some(AlertType::SystemHealth),
            "security_breach" => Some(AlertType::SecurityBreach),
            "performance" => Some(AlertType::Performance),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operational signal, optionally tied to a device.
///
/// Invariants: `acknowledged` implies `acknowledged_at` is set; resolved
/// alerts carry `resolved_at` and no longer contribute to device health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub device_id: Option<String>,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub metadata: Metadata,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(
        device_id: Option<String>,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id,
            alert_type,
            severity,
            message: message.into(),
            metadata: Metadata::new(),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.message.is_empty() {
            return Err(GatewayError::validation("alert message is required"));
        }
        Ok(())
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn is_critical(&self) -> bool {
        self.severity == AlertSeverity::Critical
    }

    pub fn acknowledge(&mut self, acknowledged_by: impl Into<String>) {
        self.acknowledged = true;
        self.acknowledged_at = Some(Utc::now());
        self.acknowledged_by = Some(acknowledged_by.into());
    }

    pub fn resolve(&mut self) {
        self.resolved_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_sets_timestamp() {
        let mut alert = Alert::new(
            Some("d1".into()),
            AlertType::DeviceOffline,
            AlertSeverity::Warning,
            "device d1 missed heartbeats",
        );
        assert!(!alert.acknowledged);
        alert.acknowledge("operator");
        assert!(alert.acknowledged);
        assert!(alert.acknowledged_at.is_some());
        assert_eq!(alert.acknowledged_by.as_deref(), Some("operator"));
    }

    #[test]
    fn test_resolve_round_trip() {
        let mut alert = Alert::new(None, AlertType::SystemHealth, AlertSeverity::Error, "db down");
        assert!(!alert.is_resolved());
        alert.resolve();
        assert!(alert.is_resolved());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::Error);
        assert!(AlertSeverity::Error > AlertSeverity::Warning);
        assert!(AlertSeverity::Warning > AlertSeverity::Info);
    }

    #[test]
    fn test_type_round_trip() {
        for t in [
            AlertType::DeviceOffline,
            AlertType::DeviceError,
            AlertType::CommandTimeout,
            AlertType::DataQuality,
            AlertType::SystemHealth,
            AlertType::SecurityBreach,
            AlertType::Performance,
        ] {
            assert_eq!(AlertType::parse(t.as_str()), Some(t));
        }
    }
}
