//! Measurement samples and batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::model::metadata::Metadata;

/// Quality of a measurement sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCode {
    Unknown,
    Good,
    Bad,
    Uncertain,
    Substituted,
}

impl QualityCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityCode::Unknown => "unknown",
            QualityCode::Good => "good",
            QualityCode::Bad => "bad",
            QualityCode::Uncertain => "uncertain",
            QualityCode::Substituted => "substituted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "good" => QualityCode::Good,
            "bad" => QualityCode::Bad,
            "uncertain" => QualityCode::Uncertain,
            "substituted" => QualityCode::Substituted,
            _ => QualityCode::Unknown,
        }
    }
}

impl std::fmt::Display for QualityCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sample pushed by a device. Immutable after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    pub id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub measurement_type: String,
    pub value: f64,
    pub unit: String,
    pub quality: QualityCode,
    pub metadata: Metadata,
    pub batch_id: Option<String>,
    /// Monotone within a batch; preserves device send order across flushes.
    pub sequence_number: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl Measurement {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.device_id.is_empty() {
            return Err(GatewayError::validation("device_id required"));
        }
        if self.measurement_type.is_empty() {
            return Err(GatewayError::validation("measurement type is required"));
        }
        Ok(())
    }

    pub fn is_good_quality(&self) -> bool {
        self.quality == QualityCode::Good
    }
}

/// A group of measurements sharing a device, a batch id, and a fallback
/// timestamp, written atomically at per-item granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementBatch {
    pub device_id: String,
    pub batch_id: String,
    /// Fallback for samples that carry no timestamp of their own.
    pub timestamp: DateTime<Utc>,
    pub measurements: Vec<Measurement>,
}

impl MeasurementBatch {
    /// Stamp the shared device id, batch id, and fallback timestamp onto
    /// every sample. Called by the repository before the bulk write.
    pub fn normalize(&mut self) {
        for m in &mut self.measurements {
            m.device_id = self.device_id.clone();
            m.batch_id = Some(self.batch_id.clone());
            if m.timestamp.timestamp() == 0 {
                m.timestamp = self.timestamp;
            }
        }
    }
}

/// Statistics over a set of measurements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasurementStats {
    pub device_id: String,
    pub measurement_type: String,
    pub count: i64,
    pub min_value: f64,
    pub max_value: f64,
    pub avg_value: f64,
    pub std_dev: f64,
    pub earliest_time: Option<DateTime<Utc>>,
    pub latest_time: Option<DateTime<Utc>>,
    pub good_quality_count: i64,
    pub bad_quality_count: i64,
}
