//! Domain model for the gateway.
//!
//! Durable entities (`Device`, `DeviceSession`, `Measurement`, `Command`,
//! `Alert`) are owned by the persistence layer; `ConnectionState` is the
//! in-memory liveness projection owned exclusively by the session registry.

mod alert;
mod command;
mod device;
mod measurement;
mod metadata;
mod session;

pub use alert::{Alert, AlertSeverity, AlertType};
pub use command::{Command, CommandResult, CommandStatus};
pub use device::{
    validate_capabilities, validate_device_id, validate_device_name, validate_device_type,
    validate_version, Device, DeviceStatus, VALID_CAPABILITIES, VALID_DEVICE_TYPES,
};
pub use measurement::{Measurement, MeasurementBatch, MeasurementStats, QualityCode};
pub use metadata::{validate_metadata, Metadata, MetadataValue};
pub use session::{ConnectionState, DeviceSession};
