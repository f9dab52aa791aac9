//! Prost types for the `lab_instrument` protocol.
//!
//! These mirror the protocol schema one-to-one and are maintained in-tree
//! so the workspace builds without a protobuf toolchain. Field tags are
//! part of the wire contract; do not renumber them.

use std::collections::HashMap;

// =============================================================================
// Enumerations
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DeviceStatus {
    DeviceStatusUnknown = 0,
    DeviceStatusOnline = 1,
    DeviceStatusOffline = 2,
    DeviceStatusError = 3,
    DeviceStatusMaintenance = 4,
    DeviceStatusConnecting = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum QualityCode {
    QualityUnknown = 0,
    QualityGood = 1,
    QualityBad = 2,
    QualityUncertain = 3,
    QualitySubstituted = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CommandStatus {
    CommandStatusUnknown = 0,
    CommandStatusPending = 1,
    CommandStatusExecuting = 2,
    CommandStatusCompleted = 3,
    CommandStatusFailed = 4,
    CommandStatusTimeout = 5,
    CommandStatusCancelled = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HealthStatus {
    HealthUnknown = 0,
    HealthServing = 1,
    HealthNotServing = 2,
}

// =============================================================================
// Registration
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterDeviceRequest {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub r#type: String,
    #[prost(string, tag = "4")]
    pub version: String,
    #[prost(string, repeated, tag = "5")]
    pub capabilities: Vec<String>,
    #[prost(map = "string, string", tag = "6")]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterDeviceResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, tag = "3")]
    pub session_id: String,
    #[prost(message, optional, tag = "4")]
    pub registered_at: Option<::prost_types::Timestamp>,
}

// =============================================================================
// Device status
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDeviceStatusRequest {
    #[prost(string, tag = "1")]
    pub device_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDeviceStatusResponse {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(enumeration = "DeviceStatus", tag = "2")]
    pub status: i32,
    #[prost(message, optional, tag = "3")]
    pub last_seen: Option<::prost_types::Timestamp>,
    #[prost(map = "string, string", tag = "4")]
    pub metadata: HashMap<String, String>,
    #[prost(string, repeated, tag = "5")]
    pub active_capabilities: Vec<String>,
    #[prost(enumeration = "HealthStatus", tag = "6")]
    pub health: i32,
}

// =============================================================================
// Device listing
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceFilter {
    #[prost(enumeration = "DeviceStatus", repeated, tag = "1")]
    pub status: Vec<i32>,
    #[prost(string, repeated, tag = "2")]
    pub types: Vec<String>,
    #[prost(message, optional, tag = "3")]
    pub last_seen_after: Option<::prost_types::Timestamp>,
    #[prost(message, optional, tag = "4")]
    pub last_seen_before: Option<::prost_types::Timestamp>,
    #[prost(map = "string, string", tag = "5")]
    pub metadata_filters: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListDevicesRequest {
    #[prost(int32, tag = "1")]
    pub page_size: i32,
    #[prost(string, tag = "2")]
    pub page_token: String,
    #[prost(string, tag = "3")]
    pub sort_by: String,
    #[prost(bool, tag = "4")]
    pub ascending: bool,
    #[prost(message, optional, tag = "5")]
    pub filter: Option<DeviceFilter>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceInfo {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub r#type: String,
    #[prost(string, tag = "4")]
    pub version: String,
    #[prost(enumeration = "DeviceStatus", tag = "5")]
    pub status: i32,
    #[prost(message, optional, tag = "6")]
    pub last_seen: Option<::prost_types::Timestamp>,
    #[prost(message, optional, tag = "7")]
    pub registered_at: Option<::prost_types::Timestamp>,
    #[prost(map = "string, string", tag = "8")]
    pub metadata: HashMap<String, String>,
    #[prost(string, repeated, tag = "9")]
    pub capabilities: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListDevicesResponse {
    #[prost(message, repeated, tag = "1")]
    pub devices: Vec<DeviceInfo>,
    #[prost(string, tag = "2")]
    pub next_page_token: String,
    #[prost(int32, tag = "3")]
    pub total_count: i32,
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendCommandRequest {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(map = "string, string", tag = "3")]
    pub parameters: HashMap<String, String>,
    #[prost(int32, tag = "4")]
    pub priority: i32,
    #[prost(int32, tag = "5")]
    pub timeout_seconds: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendCommandResponse {
    #[prost(string, tag = "1")]
    pub command_id: String,
    #[prost(enumeration = "CommandStatus", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub message: String,
}

// =============================================================================
// Measurements
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MeasurementPoint {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<::prost_types::Timestamp>,
    #[prost(string, tag = "3")]
    pub r#type: String,
    #[prost(double, tag = "4")]
    pub value: f64,
    #[prost(string, tag = "5")]
    pub unit: String,
    #[prost(enumeration = "QualityCode", tag = "6")]
    pub quality: i32,
    #[prost(map = "string, string", tag = "7")]
    pub metadata: HashMap<String, String>,
    #[prost(string, tag = "8")]
    pub batch_id: String,
    #[prost(int32, tag = "9")]
    pub sequence_number: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Aggregation {
    /// Bucket width in seconds; zero disables bucketing.
    #[prost(int64, tag = "1")]
    pub interval_seconds: i64,
    /// One of: avg, min, max, sum, count.
    #[prost(string, tag = "2")]
    pub function: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetMeasurementsRequest {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, repeated, tag = "2")]
    pub types: Vec<String>,
    #[prost(message, optional, tag = "3")]
    pub start_time: Option<::prost_types::Timestamp>,
    #[prost(message, optional, tag = "4")]
    pub end_time: Option<::prost_types::Timestamp>,
    #[prost(int32, tag = "5")]
    pub page_size: i32,
    #[prost(string, tag = "6")]
    pub page_token: String,
    #[prost(message, optional, tag = "7")]
    pub aggregation: Option<Aggregation>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AggregatedPoint {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<::prost_types::Timestamp>,
    #[prost(double, tag = "4")]
    pub value: f64,
    #[prost(int64, tag = "5")]
    pub count: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetMeasurementsResponse {
    #[prost(message, repeated, tag = "1")]
    pub measurements: Vec<MeasurementPoint>,
    #[prost(string, tag = "2")]
    pub next_page_token: String,
    #[prost(int64, tag = "3")]
    pub total_count: i64,
    #[prost(message, repeated, tag = "4")]
    pub aggregates: Vec<AggregatedPoint>,
}

// =============================================================================
// Health
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckResponse {
    #[prost(enumeration = "HealthStatus", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(map = "string, string", tag = "3")]
    pub details: HashMap<String, String>,
}

// =============================================================================
// Bidirectional data stream
// =============================================================================

/// First frame a device sends on `StreamData`, binding the stream to its
/// registered session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamAttach {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, tag = "2")]
    pub session_id: String,
}

/// Explicit liveness signal; any valid data frame also counts.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(map = "string, double", tag = "2")]
    pub metrics: HashMap<String, f64>,
}

/// Device acknowledgment for a previously delivered command.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandAckFrame {
    #[prost(string, tag = "1")]
    pub command_id: String,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(map = "string, string", tag = "4")]
    pub data: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamDataRequest {
    #[prost(oneof = "stream_data_request::Payload", tags = "1, 2, 3, 4")]
    pub payload: Option<stream_data_request::Payload>,
}

pub mod stream_data_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Attach(super::StreamAttach),
        #[prost(message, tag = "2")]
        Measurement(super::MeasurementPoint),
        #[prost(message, tag = "3")]
        Heartbeat(super::Heartbeat),
        #[prost(message, tag = "4")]
        CommandAck(super::CommandAckFrame),
    }
}

/// Command pushed to the device over the stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandFrame {
    #[prost(string, tag = "1")]
    pub command_id: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(map = "string, string", tag = "3")]
    pub parameters: HashMap<String, String>,
    #[prost(int32, tag = "4")]
    pub priority: i32,
    #[prost(int32, tag = "5")]
    pub timeout_seconds: i32,
}

/// Outcome of one ingested batch window.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IngestAck {
    #[prost(string, tag = "1")]
    pub batch_id: String,
    #[prost(int32, tag = "2")]
    pub accepted_count: i32,
    #[prost(int32, tag = "3")]
    pub rejected_count: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamDataResponse {
    #[prost(oneof = "stream_data_response::Payload", tags = "1, 2")]
    pub payload: Option<stream_data_response::Payload>,
}

pub mod stream_data_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Command(super::CommandFrame),
        #[prost(message, tag = "2")]
        IngestAck(super::IngestAck),
    }
}
