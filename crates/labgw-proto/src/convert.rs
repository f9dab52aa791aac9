//! Conversions between wire types and domain types.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use labgw_core::model as domain;

use crate::wire;

/// Trait for converting wire types to domain types.
pub trait ToDomain<T> {
    fn to_domain(self) -> T;
}

// =============================================================================
// Timestamps
// =============================================================================

/// Convert a chrono timestamp into the wire representation.
pub fn timestamp_to_wire(ts: DateTime<Utc>) -> ::prost_types::Timestamp {
    ::prost_types::Timestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    }
}

/// Convert a wire timestamp back to chrono; out-of-range values collapse
/// to `None` rather than panicking on hostile input.
pub fn timestamp_from_wire(ts: &::prost_types::Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32).single()
}

// =============================================================================
// Enumerations
// =============================================================================

impl From<domain::DeviceStatus> for wire::DeviceStatus {
    fn from(status: domain::DeviceStatus) -> Self {
        match status {
            domain::DeviceStatus::Unknown => wire::DeviceStatus::DeviceStatusUnknown,
            domain::DeviceStatus::Online => wire::DeviceStatus::DeviceStatusOnline,
            domain::DeviceStatus::Offline => wire::DeviceStatus::DeviceStatusOffline,
            domain::DeviceStatus::Error => wire::DeviceStatus::DeviceStatusError,
            domain::DeviceStatus::Maintenance => wire::DeviceStatus::DeviceStatusMaintenance,
            domain::DeviceStatus::Connecting => wire::DeviceStatus::DeviceStatusConnecting,
        }
    }
}

impl ToDomain<domain::DeviceStatus> for wire::DeviceStatus {
    fn to_domain(self) -> domain::DeviceStatus {
        match self {
            wire::DeviceStatus::DeviceStatusUnknown => domain::DeviceStatus::Unknown,
            wire::DeviceStatus::DeviceStatusOnline => domain::DeviceStatus::Online,
            wire::DeviceStatus::DeviceStatusOffline => domain::DeviceStatus::Offline,
            wire::DeviceStatus::DeviceStatusError => domain::DeviceStatus::Error,
            wire::DeviceStatus::DeviceStatusMaintenance => domain::DeviceStatus::Maintenance,
            wire::DeviceStatus::DeviceStatusConnecting => domain::DeviceStatus::Connecting,
        }
    }
}

impl From<domain::QualityCode> for wire::QualityCode {
    fn from(quality: domain::QualityCode) -> Self {
        match quality {
            domain::QualityCode::Unknown => wire::QualityCode::QualityUnknown,
            domain::QualityCode::Good => wire::QualityCode::QualityGood,
            domain::QualityCode::Bad => wire::QualityCode::QualityBad,
            domain::QualityCode::Uncertain => wire::QualityCode::QualityUncertain,
            domain::QualityCode::Substituted => wire::QualityCode::QualitySubstituted,
        }
    }
}

impl ToDomain<domain::QualityCode> for wire::QualityCode {
    fn to_domain(self) -> domain::QualityCode {
        match self {
            wire::QualityCode::QualityUnknown => domain::QualityCode::Unknown,
            wire::QualityCode::QualityGood => domain::QualityCode::Good,
            wire::QualityCode::QualityBad => domain::QualityCode::Bad,
            wire::QualityCode::QualityUncertain => domain::QualityCode::Uncertain,
            wire::QualityCode::QualitySubstituted => domain::QualityCode::Substituted,
        }
    }
}

impl From<domain::CommandStatus> for wire::CommandStatus {
    fn from(status: domain::CommandStatus) -> Self {
        match status {
            domain::CommandStatus::Unknown => wire::CommandStatus::CommandStatusUnknown,
            domain::CommandStatus::Pending => wire::CommandStatus::CommandStatusPending,
            domain::CommandStatus::Executing => wire::CommandStatus::CommandStatusExecuting,
            domain::CommandStatus::Completed => wire::CommandStatus::CommandStatusCompleted,
            domain::CommandStatus::Failed => wire::CommandStatus::CommandStatusFailed,
            domain::CommandStatus::Timeout => wire::CommandStatus::CommandStatusTimeout,
            domain::CommandStatus::Cancelled => wire::CommandStatus::CommandStatusCancelled,
        }
    }
}

impl ToDomain<domain::CommandStatus> for wire::CommandStatus {
    fn to_domain(self) -> domain::CommandStatus {
        match self {
            wire::CommandStatus::CommandStatusUnknown => domain::CommandStatus::Unknown,
            wire::CommandStatus::CommandStatusPending => domain::CommandStatus::Pending,
            wire::CommandStatus::CommandStatusExecuting => domain::CommandStatus::Executing,
            wire::CommandStatus::CommandStatusCompleted => domain::CommandStatus::Completed,
            wire::CommandStatus::CommandStatusFailed => domain::CommandStatus::Failed,
            wire::CommandStatus::CommandStatusTimeout => domain::CommandStatus::Timeout,
            wire::CommandStatus::CommandStatusCancelled => domain::CommandStatus::Cancelled,
        }
    }
}

// =============================================================================
// Metadata bags
// =============================================================================

/// Flatten a rich metadata bag into the wire's `map<string, string>`.
pub fn metadata_to_wire(metadata: &domain::Metadata) -> HashMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.as_display_string()))
        .collect()
}

/// Lift wire metadata into the domain bag. All values arrive as strings.
pub fn metadata_from_wire(metadata: &HashMap<String, String>) -> domain::Metadata {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), domain::MetadataValue::String(v.clone())))
        .collect()
}

// =============================================================================
// Entities
// =============================================================================

impl From<&domain::Device> for wire::DeviceInfo {
    fn from(device: &domain::Device) -> Self {
        wire::DeviceInfo {
            device_id: device.id.clone(),
            name: device.name.clone(),
            r#type: device.device_type.clone(),
            version: device.version.clone(),
            status: wire::DeviceStatus::from(device.status) as i32,
            last_seen: device.last_seen.map(timestamp_to_wire),
            registered_at: Some(timestamp_to_wire(device.registered_at)),
            metadata: metadata_to_wire(&device.metadata),
            capabilities: device.capabilities.clone(),
        }
    }
}

impl From<&domain::Measurement> for wire::MeasurementPoint {
    fn from(m: &domain::Measurement) -> Self {
        wire::MeasurementPoint {
            device_id: m.device_id.clone(),
            timestamp: Some(timestamp_to_wire(m.timestamp)),
            r#type: m.measurement_type.clone(),
            value: m.value,
            unit: m.unit.clone(),
            quality: wire::QualityCode::from(m.quality) as i32,
            metadata: metadata_to_wire(&m.metadata),
            batch_id: m.batch_id.clone().unwrap_or_default(),
            sequence_number: m.sequence_number.unwrap_or(0),
        }
    }
}

impl ToDomain<domain::Measurement> for wire::MeasurementPoint {
    fn to_domain(self) -> domain::Measurement {
        let quality = wire::QualityCode::try_from(self.quality)
            .unwrap_or(wire::QualityCode::QualityUnknown)
            .to_domain();
        domain::Measurement {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: self.device_id,
            timestamp: self
                .timestamp
                .as_ref()
                .and_then(timestamp_from_wire)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            measurement_type: self.r#type,
            value: self.value,
            unit: self.unit,
            quality,
            metadata: metadata_from_wire(&self.metadata),
            batch_id: if self.batch_id.is_empty() {
                None
            } else {
                Some(self.batch_id)
            },
            sequence_number: if self.sequence_number == 0 {
                None
            } else {
                Some(self.sequence_number)
            },
            created_at: Utc::now(),
        }
    }
}

impl From<&domain::Command> for wire::CommandFrame {
    fn from(command: &domain::Command) -> Self {
        wire::CommandFrame {
            command_id: command.command_id.clone(),
            r#type: command.command_type.clone(),
            parameters: metadata_to_wire(&command.parameters),
            priority: command.priority,
            timeout_seconds: command.timeout_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let wire_ts = timestamp_to_wire(now);
        let back = timestamp_from_wire(&wire_ts).unwrap();
        assert_eq!(back, now);
    }

    #[test]
    fn test_device_status_round_trip() {
        for status in [
            domain::DeviceStatus::Unknown,
            domain::DeviceStatus::Online,
            domain::DeviceStatus::Offline,
            domain::DeviceStatus::Error,
            domain::DeviceStatus::Maintenance,
            domain::DeviceStatus::Connecting,
        ] {
            let wire_status = wire::DeviceStatus::from(status);
            assert_eq!(wire_status.to_domain(), status);
            // And through the i32 representation the wire actually carries.
            let as_i32 = wire_status as i32;
            assert_eq!(
                wire::DeviceStatus::try_from(as_i32).unwrap().to_domain(),
                status
            );
        }
    }

    #[test]
    fn test_quality_round_trip() {
        for quality in [
            domain::QualityCode::Unknown,
            domain::QualityCode::Good,
            domain::QualityCode::Bad,
            domain::QualityCode::Uncertain,
            domain::QualityCode::Substituted,
        ] {
            assert_eq!(wire::QualityCode::from(quality).to_domain(), quality);
        }
    }

    #[test]
    fn test_metadata_flattening() {
        let mut metadata = domain::Metadata::new();
        metadata.insert("rack".into(), "B2".into());
        metadata.insert("channels".into(), domain::MetadataValue::Number(4.0));
        let wire_meta = metadata_to_wire(&metadata);
        assert_eq!(wire_meta.get("rack").map(String::as_str), Some("B2"));
        assert_eq!(wire_meta.get("channels").map(String::as_str), Some("4"));
    }
}
