//! Core types for the lab instrument gateway.
//!
//! This crate holds the domain model (devices, sessions, measurements,
//! commands, alerts), the application error type, the operation context
//! carried through every request, and the configuration surface. It has no
//! knowledge of the wire protocol or the database; those live in
//! `labgw-proto` and `labgw-storage`.

pub mod config;
pub mod context;
pub mod error;
pub mod limits;
pub mod model;

pub use config::GatewayConfig;
pub use context::OpContext;
pub use error::{GatewayError, GatewayResult};
pub use model::{
    Alert, AlertSeverity, AlertType, Command, CommandResult, CommandStatus, ConnectionState,
    Device, DeviceSession, DeviceStatus, Measurement, MeasurementBatch, MeasurementStats, Metadata,
    MetadataValue, QualityCode,
};
