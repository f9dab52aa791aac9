//! Device listing with opaque cursor pagination.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use labgw_core::limits;
use labgw_core::model::validate_metadata;
use labgw_core::{GatewayError, GatewayResult, OpContext};
use labgw_proto::convert::{metadata_from_wire, timestamp_from_wire, ToDomain};
use labgw_proto::wire::{self, DeviceInfo, ListDevicesRequest, ListDevicesResponse};
use labgw_storage::{DeviceFilter, Filter, RepositoryManager, SortOrder};
use serde::{Deserialize, Serialize};

const SORT_FIELDS: &[&str] = &[
    "id",
    "name",
    "type",
    "status",
    "last_seen",
    "registered_at",
    "updated_at",
];

/// Cursor payload. Cursors are not stable across sort changes; the
/// server only trusts cursors it issued itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub offset: i64,
    pub sort_by: String,
    pub order: SortOrder,
}

/// Encode a cursor as URL-safe base64 JSON.
pub fn encode_page_token(token: &PageToken) -> String {
    let json = serde_json::to_vec(token).expect("page token serializes");
    URL_SAFE.encode(json)
}

/// Decode a cursor, rejecting anything the server did not issue.
pub fn decode_page_token(token: &str) -> GatewayResult<PageToken> {
    let bytes = URL_SAFE
        .decode(token)
        .map_err(|_| GatewayError::validation("invalid page token"))?;
    serde_json::from_slice(&bytes).map_err(|_| GatewayError::validation("invalid page token"))
}

pub fn validate_request(req: &ListDevicesRequest) -> GatewayResult<()> {
    if req.page_size < 0 {
        return Err(GatewayError::validation("page_size cannot be negative"));
    }
    if req.page_size > limits::MAX_DEVICE_PAGE_SIZE {
        return Err(GatewayError::validation(format!(
            "page_size too large (max {})",
            limits::MAX_DEVICE_PAGE_SIZE
        )));
    }
    if !req.sort_by.is_empty() && !SORT_FIELDS.contains(&req.sort_by.as_str()) {
        return Err(GatewayError::validation(format!(
            "invalid sort field: {}",
            req.sort_by
        )));
    }
    if let Some(filter) = &req.filter {
        for status in &filter.status {
            if wire::DeviceStatus::try_from(*status).is_err() {
                return Err(GatewayError::validation(format!(
                    "invalid device status: {status}"
                )));
            }
        }
        for device_type in &filter.types {
            if device_type.trim().is_empty() {
                return Err(GatewayError::validation("device type cannot be empty"));
            }
        }
        if let (Some(after), Some(before)) = (&filter.last_seen_after, &filter.last_seen_before) {
            let after = timestamp_from_wire(after);
            let before = timestamp_from_wire(before);
            if let (Some(after), Some(before)) = (after, before) {
                if after > before {
                    return Err(GatewayError::validation(
                        "last_seen_after cannot be after last_seen_before",
                    ));
                }
            }
        }
        validate_metadata(&metadata_from_wire(&filter.metadata_filters))?;
    }
    Ok(())
}

pub struct ListHandler {
    repos: Arc<dyn RepositoryManager>,
}

impl ListHandler {
    pub fn new(repos: Arc<dyn RepositoryManager>) -> Self {
        Self { repos }
    }

    pub async fn list_devices(
        &self,
        ctx: &OpContext,
        req: ListDevicesRequest,
    ) -> GatewayResult<ListDevicesResponse> {
        let filter = build_filter(&req)?;

        let devices = self.repos.device().list(ctx, &filter).await?;
        let total_count = self.repos.device().count(ctx, &filter).await?;

        let device_infos: Vec<DeviceInfo> = devices.iter().map(DeviceInfo::from).collect();

        let next_offset = filter.filter.offset + devices.len() as i64;
        let next_page_token = if next_offset < total_count {
            encode_page_token(&PageToken {
                offset: next_offset,
                sort_by: filter
                    .filter
                    .sort_by
                    .clone()
                    .unwrap_or_else(|| "updated_at".to_string()),
                order: filter.filter.order,
            })
        } else {
            String::new()
        };

        Ok(ListDevicesResponse {
            devices: device_infos,
            next_page_token,
            total_count: total_count as i32,
        })
    }
}

/// Translate the wire request into a repository filter. `page_size = 0`
/// coerces to the default; the cursor's offset wins over a fresh start.
fn build_filter(req: &ListDevicesRequest) -> GatewayResult<DeviceFilter> {
    let offset = if req.page_token.is_empty() {
        0
    } else {
        decode_page_token(&req.page_token)?.offset.max(0)
    };

    let (sort_by, order) = if req.sort_by.is_empty() {
        ("updated_at".to_string(), SortOrder::Desc)
    } else {
        (
            req.sort_by.clone(),
            if req.ascending {
                SortOrder::Asc
            } else {
                SortOrder::Desc
            },
        )
    };

    let mut filter = DeviceFilter {
        filter: Filter {
            limit: if req.page_size <= 0 {
                i64::from(limits::DEFAULT_PAGE_SIZE)
            } else {
                i64::from(req.page_size)
            },
            offset,
            sort_by: Some(sort_by),
            order,
        },
        ..DeviceFilter::default()
    };

    if let Some(wire_filter) = &req.filter {
        filter.statuses = wire_filter
            .status
            .iter()
            .filter_map(|s| wire::DeviceStatus::try_from(*s).ok())
            .map(ToDomain::to_domain)
            .collect();
        filter.types = wire_filter
            .types
            .iter()
            .map(|t| t.trim().to_lowercase())
            .collect();
        filter.last_seen_after = wire_filter
            .last_seen_after
            .as_ref()
            .and_then(timestamp_from_wire);
        filter.last_seen_before = wire_filter
            .last_seen_before
            .as_ref()
            .and_then(timestamp_from_wire);
        filter.metadata_filters = wire_filter.metadata_filters.clone();
    }

    Ok(filter)
}
