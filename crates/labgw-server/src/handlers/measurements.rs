//! Historical measurement queries.

use std::sync::Arc;
use std::time::Duration;

use labgw_core::limits;
use labgw_core::model::validate_device_id;
use labgw_core::{GatewayError, GatewayResult, OpContext};
use labgw_proto::convert::{timestamp_from_wire, timestamp_to_wire};
use labgw_proto::wire::{
    AggregatedPoint, GetMeasurementsRequest, GetMeasurementsResponse, MeasurementPoint,
};
use labgw_storage::{
    AggregationRequest, Filter, MeasurementFilter, RepositoryManager, SortOrder, TimeRange,
};

use crate::handlers::list::{decode_page_token, encode_page_token, PageToken};

const AGGREGATION_FUNCTIONS: &[&str] = &["avg", "min", "max", "sum", "count"];

pub fn validate_request(req: &GetMeasurementsRequest) -> GatewayResult<()> {
    validate_device_id(&req.device_id)?;
    if req.page_size < 0 {
        return Err(GatewayError::validation("page_size cannot be negative"));
    }
    if req.page_size > limits::MAX_MEASUREMENT_PAGE_SIZE {
        return Err(GatewayError::validation(format!(
            "page_size too large (max {})",
            limits::MAX_MEASUREMENT_PAGE_SIZE
        )));
    }
    if let (Some(start), Some(end)) = (&req.start_time, &req.end_time) {
        if let (Some(start), Some(end)) = (timestamp_from_wire(start), timestamp_from_wire(end)) {
            if start > end {
                return Err(GatewayError::validation(
                    "start_time cannot be after end_time",
                ));
            }
        }
    }
    if let Some(aggregation) = &req.aggregation {
        if aggregation.interval_seconds < 0 {
            return Err(GatewayError::validation(
                "aggregation interval cannot be negative",
            ));
        }
        let function = aggregation.function.to_lowercase();
        if !AGGREGATION_FUNCTIONS.contains(&function.as_str()) {
            return Err(GatewayError::validation(format!(
                "invalid aggregation function: {}",
                aggregation.function
            )));
        }
    }
    Ok(())
}

pub struct MeasurementsHandler {
    repos: Arc<dyn RepositoryManager>,
}

impl MeasurementsHandler {
    pub fn new(repos: Arc<dyn RepositoryManager>) -> Self {
        Self { repos }
    }

    pub async fn get_measurements(
        &self,
        ctx: &OpContext,
        req: GetMeasurementsRequest,
    ) -> GatewayResult<GetMeasurementsResponse> {
        let offset = if req.page_token.is_empty() {
            0
        } else {
            decode_page_token(&req.page_token)?.offset.max(0)
        };

        let time_range = TimeRange {
            start: req.start_time.as_ref().and_then(timestamp_from_wire),
            end: req.end_time.as_ref().and_then(timestamp_from_wire),
        };
        let filter = MeasurementFilter {
            filter: Filter {
                limit: if req.page_size <= 0 {
                    i64::from(limits::DEFAULT_PAGE_SIZE)
                } else {
                    i64::from(req.page_size)
                },
                offset,
                sort_by: Some("timestamp".to_string()),
                order: SortOrder::Desc,
            },
            time_range: time_range.clone(),
            device_ids: vec![req.device_id.clone()],
            types: req.types.clone(),
            ..MeasurementFilter::default()
        };

        let measurements = self.repos.measurement().list(ctx, &filter).await?;
        let total_count = self.repos.measurement().count(ctx, &filter).await?;

        let aggregates = match &req.aggregation {
            Some(aggregation) => {
                let request = AggregationRequest {
                    device_ids: vec![req.device_id.clone()],
                    types: req.types.clone(),
                    time_range,
                    group_by_interval: Duration::from_secs(
                        aggregation.interval_seconds.max(0) as u64
                    ),
                    aggregation_type: aggregation.function.to_lowercase(),
                };
                self.repos
                    .measurement()
                    .aggregate(ctx, &request)
                    .await?
                    .into_iter()
                    .map(|bucket| AggregatedPoint {
                        device_id: bucket.device_id,
                        r#type: bucket.measurement_type,
                        timestamp: Some(timestamp_to_wire(bucket.timestamp)),
                        value: bucket.value,
                        count: bucket.count,
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        let next_offset = offset + measurements.len() as i64;
        let next_page_token = if next_offset < total_count {
            encode_page_token(&PageToken {
                offset: next_offset,
                sort_by: "timestamp".to_string(),
                order: SortOrder::Desc,
            })
        } else {
            String::new()
        };

        Ok(GetMeasurementsResponse {
            measurements: measurements.iter().map(MeasurementPoint::from).collect(),
            next_page_token,
            total_count,
            aggregates,
        })
    }
}
