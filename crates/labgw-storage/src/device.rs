//! Postgres implementation of the device repository.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labgw_core::model::{Device, DeviceStatus};
use labgw_core::{GatewayError, GatewayResult, OpContext};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::repository::{BulkResult, DeviceFilter, DeviceRepository};
use crate::retry::with_backoff;
use crate::sql::{
    clamp_page, map_sqlx_error, metadata_from_row, metadata_to_json, optional_timestamp,
    required_string, required_timestamp, resolve_sort,
};

const SORTABLE: &[&str] = &[
    "id",
    "name",
    "type",
    "status",
    "last_seen",
    "registered_at",
    "updated_at",
];

const COLUMNS: &str = "id, name, type, version, status, metadata, capabilities, \
                       last_seen, registered_at, created_at, updated_at";

pub struct PostgresDeviceRepository {
    pool: PgPool,
}

impl PostgresDeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn device_from_row(row: &PgRow) -> GatewayResult<Device> {
    let status: String = required_string(row, "status")?;
    Ok(Device {
        id: required_string(row, "id")?,
        name: required_string(row, "name")?,
        device_type: required_string(row, "type")?,
        version: required_string(row, "version")?,
        status: DeviceStatus::parse(&status),
        metadata: metadata_from_row(row, "metadata")?,
        capabilities: row
            .try_get("capabilities")
            .map_err(|e| GatewayError::Internal(format!("decode capabilities: {e}")))?,
        last_seen: optional_timestamp(row, "last_seen")?,
        registered_at: required_timestamp(row, "registered_at")?,
        created_at: required_timestamp(row, "created_at")?,
        updated_at: required_timestamp(row, "updated_at")?,
    })
}

/// Append the filter's predicates to a query that already names the table.
fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &DeviceFilter) -> GatewayResult<()> {
    qb.push(" WHERE 1 = 1");
    if !filter.device_ids.is_empty() {
        qb.push(" AND id = ANY(");
        qb.push_bind(filter.device_ids.clone());
        qb.push(")");
    }
    if !filter.types.is_empty() {
        qb.push(" AND type = ANY(");
        qb.push_bind(filter.types.clone());
        qb.push(")");
    }
    if !filter.statuses.is_empty() {
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        qb.push(" AND status = ANY(");
        qb.push_bind(statuses);
        qb.push(")");
    }
    if !filter.capabilities.is_empty() {
        qb.push(" AND capabilities @> ");
        qb.push_bind(filter.capabilities.clone());
    }
    if let Some(after) = filter.last_seen_after {
        qb.push(" AND last_seen >= ");
        qb.push_bind(after);
    }
    if let Some(before) = filter.last_seen_before {
        qb.push(" AND last_seen <= ");
        qb.push_bind(before);
    }
    if !filter.metadata_filters.is_empty() {
        let object: serde_json::Map<String, serde_json::Value> = filter
            .metadata_filters
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        qb.push(" AND metadata @> ");
        qb.push_bind(serde_json::Value::Object(object));
    }
    Ok(())
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    async fn create(&self, ctx: &OpContext, device: &Device) -> GatewayResult<()> {
        device.validate()?;
        let metadata = metadata_to_json(&device.metadata)?;
        with_backoff(ctx, "device.create", || async {
            sqlx::query(
                "INSERT INTO devices \
                 (id, name, type, version, status, metadata, capabilities, \
                  last_seen, registered_at, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(&device.id)
            .bind(&device.name)
            .bind(&device.device_type)
            .bind(&device.version)
            .bind(device.status.as_str())
            .bind(&metadata)
            .bind(&device.capabilities)
            .bind(device.last_seen)
            .bind(device.registered_at)
            .bind(device.created_at)
            .bind(device.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("device", e))?;
            Ok(())
        })
        .await
    }

    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Device>> {
        with_backoff(ctx, "device.get_by_id", || async {
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM devices WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("device", e))?;
            row.as_ref().map(device_from_row).transpose()
        })
        .await
    }

    async fn update(&self, ctx: &OpContext, device: &Device) -> GatewayResult<()> {
        device.validate()?;
        let metadata = metadata_to_json(&device.metadata)?;
        let result = with_backoff(ctx, "device.update", || async {
            sqlx::query(
                "UPDATE devices SET name = $2, type = $3, version = $4, status = $5, \
                 metadata = $6, capabilities = $7, last_seen = $8, updated_at = $9 \
                 WHERE id = $1",
            )
            .bind(&device.id)
            .bind(&device.name)
            .bind(&device.device_type)
            .bind(&device.version)
            .bind(device.status.as_str())
            .bind(&metadata)
            .bind(&device.capabilities)
            .bind(device.last_seen)
            .bind(device.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("device", e))
        })
        .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("device"));
        }
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()> {
        let result = ctx
            .run(async {
                sqlx::query("DELETE FROM devices WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("device", e))
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("device"));
        }
        Ok(())
    }

    async fn create_bulk(&self, ctx: &OpContext, devices: &[Device]) -> GatewayResult<BulkResult> {
        let mut result = BulkResult::default();
        for (index, device) in devices.iter().enumerate() {
            ctx.check()?;
            if let Err(err) = device.validate() {
                result.record_failure(index, err.to_string());
                continue;
            }
            match self.create(ctx, device).await {
                Ok(()) => result.record_success(),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => result.record_failure(index, err.to_string()),
            }
        }
        Ok(result)
    }

    async fn update_bulk(&self, ctx: &OpContext, devices: &[Device]) -> GatewayResult<BulkResult> {
        let mut result = BulkResult::default();
        for (index, device) in devices.iter().enumerate() {
            ctx.check()?;
            match self.update(ctx, device).await {
                Ok(()) => result.record_success(),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => result.record_failure(index, err.to_string()),
            }
        }
        Ok(result)
    }

    async fn list(&self, ctx: &OpContext, filter: &DeviceFilter) -> GatewayResult<Vec<Device>> {
        let (sort_col, order) = resolve_sort(&filter.filter, SORTABLE, "updated_at")?;
        let (limit, offset) = clamp_page(
            &filter.filter,
            i64::from(labgw_core::limits::MAX_DEVICE_PAGE_SIZE),
        );
        ctx.run(async {
            let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM devices"));
            push_filters(&mut qb, filter)?;
            qb.push(format!(" ORDER BY {sort_col} {}", order.as_sql()));
            qb.push(" LIMIT ");
            qb.push_bind(limit);
            qb.push(" OFFSET ");
            qb.push_bind(offset);

            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("device", e))?;
            rows.iter().map(device_from_row).collect()
        })
        .await
    }

    async fn count(&self, ctx: &OpContext, filter: &DeviceFilter) -> GatewayResult<i64> {
        ctx.run(async {
            let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM devices");
            push_filters(&mut qb, filter)?;
            let row = qb
                .build()
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("device", e))?;
            row.try_get::<i64, _>(0)
                .map_err(|e| GatewayError::Internal(format!("decode count: {e}")))
        })
        .await
    }

    async fn update_status(
        &self,
        ctx: &OpContext,
        device_id: &str,
        status: DeviceStatus,
    ) -> GatewayResult<()> {
        let result = with_backoff(ctx, "device.update_status", || async {
            sqlx::query("UPDATE devices SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(device_id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("device", e))
        })
        .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("device"));
        }
        Ok(())
    }

    async fn update_last_seen(
        &self,
        ctx: &OpContext,
        device_id: &str,
        timestamp: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let result = with_backoff(ctx, "device.update_last_seen", || async {
            sqlx::query("UPDATE devices SET last_seen = $2, updated_at = NOW() WHERE id = $1")
                .bind(device_id)
                .bind(timestamp)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("device", e))
        })
        .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("device"));
        }
        Ok(())
    }

    async fn search_by_metadata(
        &self,
        ctx: &OpContext,
        metadata: &HashMap<String, String>,
    ) -> GatewayResult<Vec<Device>> {
        let object: serde_json::Map<String, serde_json::Value> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM devices WHERE metadata @> $1 ORDER BY updated_at DESC"
            ))
            .bind(serde_json::Value::Object(object))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("device", e))?;
            rows.iter().map(device_from_row).collect()
        })
        .await
    }

    async fn get_by_capability(
        &self,
        ctx: &OpContext,
        capability: &str,
    ) -> GatewayResult<Vec<Device>> {
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM devices WHERE $1 = ANY(capabilities) \
                 ORDER BY updated_at DESC"
            ))
            .bind(capability)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("device", e))?;
            rows.iter().map(device_from_row).collect()
        })
        .await
    }

    async fn get_online(&self, ctx: &OpContext) -> GatewayResult<Vec<Device>> {
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM devices WHERE status = 'online' ORDER BY last_seen DESC"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("device", e))?;
            rows.iter().map(device_from_row).collect()
        })
        .await
    }

    async fn get_offline(
        &self,
        ctx: &OpContext,
        threshold: Duration,
    ) -> GatewayResult<Vec<Device>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold)
                .map_err(|e| GatewayError::validation(format!("invalid threshold: {e}")))?;
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM devices \
                 WHERE status = 'offline' OR last_seen IS NULL OR last_seen < $1 \
                 ORDER BY last_seen ASC NULLS FIRST"
            ))
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("device", e))?;
            rows.iter().map(device_from_row).collect()
        })
        .await
    }
}
