//! Repository traits, filters, and bulk-result types.
//!
//! The traits are the persistence contract the rest of the gateway codes
//! against; `labgw-server` tests supply in-memory implementations, the
//! production wiring uses the Postgres implementations in this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labgw_core::model::{
    Alert, AlertSeverity, AlertType, Command, CommandStatus, Device, DeviceStatus, Measurement,
    MeasurementBatch, MeasurementStats, QualityCode,
};
use labgw_core::{GatewayResult, OpContext};
use std::collections::HashMap;
use std::time::Duration;

use labgw_core::limits;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SortOrder {
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Common pagination and sorting skeleton shared by all filters.
#[derive(Debug, Clone)]
pub struct Filter {
    pub limit: i64,
    pub offset: i64,
    pub sort_by: Option<String>,
    pub order: SortOrder,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            limit: i64::from(limits::DEFAULT_PAGE_SIZE),
            offset: 0,
            sort_by: None,
            order: SortOrder::Desc,
        }
    }
}

/// Inclusive time window.
#[derive(Debug, Clone, Default)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Device listing predicates.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub filter: Filter,
    pub device_ids: Vec<String>,
    pub types: Vec<String>,
    pub statuses: Vec<DeviceStatus>,
    pub capabilities: Vec<String>,
    pub last_seen_after: Option<DateTime<Utc>>,
    pub last_seen_before: Option<DateTime<Utc>>,
    pub metadata_filters: HashMap<String, String>,
}

/// Measurement query predicates.
#[derive(Debug, Clone, Default)]
pub struct MeasurementFilter {
    pub filter: Filter,
    pub time_range: TimeRange,
    pub device_ids: Vec<String>,
    pub types: Vec<String>,
    pub qualities: Vec<QualityCode>,
    pub batch_id: Option<String>,
}

/// Command query predicates.
#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub filter: Filter,
    pub time_range: TimeRange,
    pub device_ids: Vec<String>,
    pub types: Vec<String>,
    pub statuses: Vec<CommandStatus>,
}

/// Alert query predicates.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub filter: Filter,
    pub time_range: TimeRange,
    pub device_ids: Vec<String>,
    pub types: Vec<AlertType>,
    pub severities: Vec<AlertSeverity>,
    pub acknowledged: Option<bool>,
    pub resolved: Option<bool>,
}

/// Aggregation request over measurements.
#[derive(Debug, Clone)]
pub struct AggregationRequest {
    pub device_ids: Vec<String>,
    pub types: Vec<String>,
    pub time_range: TimeRange,
    /// Bucket width; zero means one bucket over the whole range.
    pub group_by_interval: Duration,
    /// One of: avg, min, max, sum, count.
    pub aggregation_type: String,
}

/// One aggregated bucket.
#[derive(Debug, Clone)]
pub struct AggregationResult {
    pub device_id: String,
    pub measurement_type: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub count: i64,
}

/// Per-item failure inside a bulk write.
#[derive(Debug, Clone)]
pub struct BulkError {
    /// Index of the failed item in the submitted slice.
    pub index: usize,
    pub reason: String,
}

/// Result of a bulk write. The write commits at per-item granularity;
/// callers must consult `errors` to learn which items were dropped.
#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub errors: Vec<BulkError>,
}

impl BulkResult {
    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn record_failure(&mut self, index: usize, reason: impl Into<String>) {
        self.failure_count += 1;
        self.errors.push(BulkError {
            index,
            reason: reason.into(),
        });
    }
}

// =============================================================================
// Repository traits
// =============================================================================

/// Durable device records.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn create(&self, ctx: &OpContext, device: &Device) -> GatewayResult<()>;
    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Device>>;
    async fn update(&self, ctx: &OpContext, device: &Device) -> GatewayResult<()>;
    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()>;

    async fn create_bulk(&self, ctx: &OpContext, devices: &[Device]) -> GatewayResult<BulkResult>;
    async fn update_bulk(&self, ctx: &OpContext, devices: &[Device]) -> GatewayResult<BulkResult>;

    async fn list(&self, ctx: &OpContext, filter: &DeviceFilter) -> GatewayResult<Vec<Device>>;
    async fn count(&self, ctx: &OpContext, filter: &DeviceFilter) -> GatewayResult<i64>;

    async fn update_status(
        &self,
        ctx: &OpContext,
        device_id: &str,
        status: DeviceStatus,
    ) -> GatewayResult<()>;
    async fn update_last_seen(
        &self,
        ctx: &OpContext,
        device_id: &str,
        timestamp: DateTime<Utc>,
    ) -> GatewayResult<()>;

    async fn search_by_metadata(
        &self,
        ctx: &OpContext,
        metadata: &HashMap<String, String>,
    ) -> GatewayResult<Vec<Device>>;
    async fn get_by_capability(
        &self,
        ctx: &OpContext,
        capability: &str,
    ) -> GatewayResult<Vec<Device>>;

    async fn get_online(&self, ctx: &OpContext) -> GatewayResult<Vec<Device>>;
    async fn get_offline(&self, ctx: &OpContext, threshold: Duration)
        -> GatewayResult<Vec<Device>>;
}

/// Measurement samples, including the streaming bulk-write path.
#[async_trait]
pub trait MeasurementRepository: Send + Sync {
    async fn create(&self, ctx: &OpContext, measurement: &Measurement) -> GatewayResult<()>;
    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Measurement>>;
    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()>;

    async fn create_bulk(
        &self,
        ctx: &OpContext,
        measurements: &[Measurement],
    ) -> GatewayResult<BulkResult>;
    /// Stamp the batch's shared device id, batch id, and fallback
    /// timestamp onto every sample, then bulk-write.
    async fn create_batch(
        &self,
        ctx: &OpContext,
        batch: &MeasurementBatch,
    ) -> GatewayResult<BulkResult>;

    async fn list(
        &self,
        ctx: &OpContext,
        filter: &MeasurementFilter,
    ) -> GatewayResult<Vec<Measurement>>;
    async fn count(&self, ctx: &OpContext, filter: &MeasurementFilter) -> GatewayResult<i64>;

    async fn get_by_time_range(
        &self,
        ctx: &OpContext,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> GatewayResult<Vec<Measurement>>;
    async fn get_latest(
        &self,
        ctx: &OpContext,
        device_id: &str,
        measurement_type: &str,
    ) -> GatewayResult<Option<Measurement>>;
    async fn get_latest_by_device(
        &self,
        ctx: &OpContext,
        device_id: &str,
        limit: i64,
    ) -> GatewayResult<Vec<Measurement>>;

    async fn aggregate(
        &self,
        ctx: &OpContext,
        request: &AggregationRequest,
    ) -> GatewayResult<Vec<AggregationResult>>;
    async fn get_statistics(
        &self,
        ctx: &OpContext,
        filter: &MeasurementFilter,
    ) -> GatewayResult<MeasurementStats>;

    async fn delete_older_than(
        &self,
        ctx: &OpContext,
        threshold: DateTime<Utc>,
    ) -> GatewayResult<i64>;
    async fn delete_by_device(&self, ctx: &OpContext, device_id: &str) -> GatewayResult<i64>;

    /// Create the monthly partition covering `(year, month)` if absent.
    async fn ensure_partition(&self, ctx: &OpContext, year: i32, month: u32) -> GatewayResult<()>;
}

/// Commands and their lifecycle transitions.
#[async_trait]
pub trait CommandRepository: Send + Sync {
    async fn create(&self, ctx: &OpContext, command: &Command) -> GatewayResult<()>;
    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Command>>;
    async fn get_by_command_id(
        &self,
        ctx: &OpContext,
        command_id: &str,
    ) -> GatewayResult<Option<Command>>;
    async fn update(&self, ctx: &OpContext, command: &Command) -> GatewayResult<()>;
    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()>;

    async fn list(&self, ctx: &OpContext, filter: &CommandFilter) -> GatewayResult<Vec<Command>>;
    async fn count(&self, ctx: &OpContext, filter: &CommandFilter) -> GatewayResult<i64>;

    /// Pending commands for one device, priority DESC then submitted ASC.
    async fn get_pending(&self, ctx: &OpContext, device_id: &str) -> GatewayResult<Vec<Command>>;
    async fn get_executing(&self, ctx: &OpContext, device_id: &str)
        -> GatewayResult<Vec<Command>>;
    async fn update_status(
        &self,
        ctx: &OpContext,
        command_id: &str,
        status: CommandStatus,
    ) -> GatewayResult<()>;

    async fn get_expired(&self, ctx: &OpContext) -> GatewayResult<Vec<Command>>;
    /// Idempotent: transitions (pending or executing) commands whose
    /// `expires_at` has passed to `timeout` and records a terminal error
    /// message. Returns the transitioned commands.
    async fn mark_expired_as_timeout(&self, ctx: &OpContext) -> GatewayResult<Vec<Command>>;
    async fn delete_completed_older_than(
        &self,
        ctx: &OpContext,
        threshold: DateTime<Utc>,
    ) -> GatewayResult<i64>;

    async fn get_command_stats(
        &self,
        ctx: &OpContext,
        device_id: &str,
        range: &TimeRange,
    ) -> GatewayResult<HashMap<CommandStatus, i64>>;
}

/// Operational alerts.
#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn create(&self, ctx: &OpContext, alert: &Alert) -> GatewayResult<()>;
    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Alert>>;
    async fn update(&self, ctx: &OpContext, alert: &Alert) -> GatewayResult<()>;
    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()>;

    async fn list(&self, ctx: &OpContext, filter: &AlertFilter) -> GatewayResult<Vec<Alert>>;
    async fn count(&self, ctx: &OpContext, filter: &AlertFilter) -> GatewayResult<i64>;

    async fn acknowledge(
        &self,
        ctx: &OpContext,
        alert_id: &str,
        acknowledged_by: &str,
    ) -> GatewayResult<()>;
    async fn resolve(&self, ctx: &OpContext, alert_id: &str) -> GatewayResult<()>;

    async fn get_unacknowledged(&self, ctx: &OpContext) -> GatewayResult<Vec<Alert>>;
    async fn get_unresolved(&self, ctx: &OpContext) -> GatewayResult<Vec<Alert>>;
    async fn get_critical(&self, ctx: &OpContext) -> GatewayResult<Vec<Alert>>;

    async fn get_alert_stats(
        &self,
        ctx: &OpContext,
        range: &TimeRange,
    ) -> GatewayResult<HashMap<AlertSeverity, i64>>;
    async fn get_alerts_by_device(
        &self,
        ctx: &OpContext,
        device_id: &str,
        limit: i64,
    ) -> GatewayResult<Vec<Alert>>;

    async fn delete_resolved_older_than(
        &self,
        ctx: &OpContext,
        threshold: DateTime<Utc>,
    ) -> GatewayResult<i64>;
}
