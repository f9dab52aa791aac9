//! Durable device identity and status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::limits;
use crate::model::metadata::{validate_metadata, Metadata};

/// Device types the gateway accepts at registration.
pub const VALID_DEVICE_TYPES: &[&str] = &[
    "sensor",
    "actuator",
    "analyzer",
    "controller",
    "spectrometer",
    "chromatograph",
    "microscope",
    "balance",
    "ph_meter",
    "thermometer",
    "other",
];

/// Capabilities a device may declare.
pub const VALID_CAPABILITIES: &[&str] = &[
    "temperature",
    "humidity",
    "pressure",
    "ph",
    "conductivity",
    "turbidity",
    "dissolved_oxygen",
    "flow_rate",
    "level",
    "weight",
    "vibration",
    "acceleration",
    "voltage",
    "current",
    "power",
    "frequency",
    "spectrum",
    "image",
    "control",
    "calibration",
];

/// Lifecycle status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Unknown,
    Online,
    Offline,
    Error,
    Maintenance,
    Connecting,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
            DeviceStatus::Maintenance => "maintenance",
            DeviceStatus::Connecting => "connecting",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            "error" => DeviceStatus::Error,
            "maintenance" => DeviceStatus::Maintenance,
            "connecting" => DeviceStatus::Connecting,
            _ => DeviceStatus::Unknown,
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A laboratory instrument known to the gateway.
///
/// The identity is immutable once created; everything else is updated on
/// re-registration, status change, or heartbeat. Devices are never deleted
/// by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub device_type: String,
    pub version: String,
    pub status: DeviceStatus,
    pub metadata: Metadata,
    pub capabilities: Vec<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Validate the device against the registration rules.
    pub fn validate(&self) -> GatewayResult<()> {
        validate_device_id(&self.id)?;
        validate_device_name(&self.name)?;
        validate_device_type(&self.device_type)?;
        validate_version(&self.version)?;
        validate_capabilities(&self.capabilities)?;
        validate_metadata(&self.metadata)?;
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Update the status and touch `updated_at`.
    pub fn set_status(&mut self, status: DeviceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Record activity: bumps `last_seen` and `updated_at`.
    pub fn touch_last_seen(&mut self) {
        let now = Utc::now();
        self.last_seen = Some(now);
        self.updated_at = now;
    }
}

pub fn validate_device_id(id: &str) -> GatewayResult<()> {
    let id = id.trim();
    if id.is_empty() {
        return Err(GatewayError::validation("device_id is required"));
    }
    if id.len() > limits::MAX_DEVICE_ID_LEN {
        return Err(GatewayError::validation(format!(
            "device_id too long (max {} characters)",
            limits::MAX_DEVICE_ID_LEN
        )));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(GatewayError::validation(
            "device_id cannot contain whitespace characters",
        ));
    }
    Ok(())
}

pub fn validate_device_name(name: &str) -> GatewayResult<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(GatewayError::validation("device name is required"));
    }
    if name.len() > limits::MAX_DEVICE_NAME_LEN {
        return Err(GatewayError::validation(format!(
            "device name too long (max {} characters)",
            limits::MAX_DEVICE_NAME_LEN
        )));
    }
    Ok(())
}

pub fn validate_device_type(device_type: &str) -> GatewayResult<()> {
    let device_type = device_type.trim();
    if device_type.is_empty() {
        return Err(GatewayError::validation("device type is required"));
    }
    if !VALID_DEVICE_TYPES.contains(&device_type.to_lowercase().as_str()) {
        return Err(GatewayError::validation(format!(
            "invalid device type: {device_type}"
        )));
    }
    Ok(())
}

pub fn validate_version(version: &str) -> GatewayResult<()> {
    let version = version.trim();
    if version.is_empty() {
        return Err(GatewayError::validation("firmware version is required"));
    }
    if version.len() > limits::MAX_VERSION_LEN {
        return Err(GatewayError::validation(format!(
            "firmware version too long (max {} characters)",
            limits::MAX_VERSION_LEN
        )));
    }
    Ok(())
}

pub fn validate_capabilities(capabilities: &[String]) -> GatewayResult<()> {
    if capabilities.is_empty() {
        return Err(GatewayError::validation(
            "at least one capability is required",
        ));
    }
    for capability in capabilities {
        let normalized = capability.trim().to_lowercase();
        if !VALID_CAPABILITIES.contains(&normalized.as_str()) {
            return Err(GatewayError::validation(format!(
                "invalid capability: {capability}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device() -> Device {
        let now = Utc::now();
        Device {
            id: "spec-001".into(),
            name: "Spectrometer Alpha".into(),
            device_type: "spectrometer".into(),
            version: "1.2.3".into(),
            status: DeviceStatus::Connecting,
            metadata: Metadata::new(),
            capabilities: vec!["spectrum".into(), "calibration".into()],
            last_seen: None,
            registered_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_valid_device_passes() {
        assert!(sample_device().validate().is_ok());
    }

    #[test]
    fn test_device_id_bounds() {
        let mut device = sample_device();
        device.id = "a".repeat(256);
        assert!(device.validate().is_err());

        device.id = "has space".into();
        assert!(device.validate().is_err());

        device.id = String::new();
        assert!(device.validate().is_err());
    }

    #[test]
    fn test_empty_capabilities_rejected() {
        let mut device = sample_device();
        device.capabilities.clear();
        assert!(device.validate().is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut device = sample_device();
        device.device_type = "teleporter".into();
        assert!(device.validate().is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            DeviceStatus::Unknown,
            DeviceStatus::Online,
            DeviceStatus::Offline,
            DeviceStatus::Error,
            DeviceStatus::Maintenance,
            DeviceStatus::Connecting,
        ] {
            assert_eq!(DeviceStatus::parse(status.as_str()), status);
            let json = serde_json::to_string(&status).unwrap();
            let back: DeviceStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn test_set_status_touches_updated_at() {
        let mut device = sample_device();
        let before = device.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        device.set_status(DeviceStatus::Online);
        assert!(device.updated_at > before);
        assert!(device.is_online());
    }
}
