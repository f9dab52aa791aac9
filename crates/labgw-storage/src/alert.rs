//! Postgres implementation of the alert repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labgw_core::model::{Alert, AlertSeverity, AlertType};
use labgw_core::{GatewayError, GatewayResult, OpContext};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::repository::{AlertFilter, AlertRepository, TimeRange};
use crate::retry::with_backoff;
use crate::sql::{
    clamp_page, map_sqlx_error, metadata_from_row, metadata_to_json, optional_string,
    optional_timestamp, required_string, required_timestamp, resolve_sort,
};

const SORTABLE: &[&str] = &["created_at", "severity", "type", "device_id", "acknowledged"];

const COLUMNS: &str = "id, device_id, type, severity, message, metadata, acknowledged, \
                       acknowledged_at, acknowledged_by, created_at, resolved_at";

pub struct PostgresAlertRepository {
    pool: PgPool,
}

impl PostgresAlertRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn alert_from_row(row: &PgRow) -> GatewayResult<Alert> {
    let alert_type: String = required_string(row, "type")?;
    let severity: String = required_string(row, "severity")?;
    Ok(Alert {
        id: required_string(row, "id")?,
        device_id: optional_string(row, "device_id")?,
        alert_type: AlertType::parse(&alert_type)
            .ok_or_else(|| GatewayError::Internal(format!("unknown alert type: {alert_type}")))?,
        severity: AlertSeverity::parse(&severity).ok_or_else(|| {
            GatewayError::Internal(format!("unknown alert severity: {severity}"))
        })?,
        message: required_string(row, "message")?,
        metadata: metadata_from_row(row, "metadata")?,
        acknowledged: row
            .try_get("acknowledged")
            .map_err(|e| GatewayError::Internal(format!("decode acknowledged: {e}")))?,
        acknowledged_at: optional_timestamp(row, "acknowledged_at")?,
        acknowledged_by: optional_string(row, "acknowledged_by")?,
        created_at: required_timestamp(row, "created_at")?,
        resolved_at: optional_timestamp(row, "resolved_at")?,
    })
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &AlertFilter) {
    qb.push(" WHERE 1 = 1");
    if !filter.device_ids.is_empty() {
        qb.push(" AND device_id = ANY(");
        qb.push_bind(filter.device_ids.clone());
        qb.push(")");
    }
    if !filter.types.is_empty() {
        let types: Vec<String> = filter.types.iter().map(|t| t.as_str().to_string()).collect();
        qb.push(" AND type = ANY(");
        qb.push_bind(types);
        qb.push(")");
    }
    if !filter.severities.is_empty() {
        let severities: Vec<String> = filter
            .severities
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        qb.push(" AND severity = ANY(");
        qb.push_bind(severities);
        qb.push(")");
    }
    if let Some(acknowledged) = filter.acknowledged {
        qb.push(" AND acknowledged = ");
        qb.push_bind(acknowledged);
    }
    if let Some(resolved) = filter.resolved {
        if resolved {
            qb.push(" AND resolved_at IS NOT NULL");
        } else {
            qb.push(" AND resolved_at IS NULL");
        }
    }
    if let Some(start) = filter.time_range.start {
        qb.push(" AND created_at >= ");
        qb.push_bind(start);
    }
    if let Some(end) = filter.time_range.end {
        qb.push(" AND created_at <= ");
        qb.push_bind(end);
    }
}

#[async_trait]
impl AlertRepository for PostgresAlertRepository {
    async fn create(&self, ctx: &OpContext, alert: &Alert) -> GatewayResult<()> {
        alert.validate()?;
        let metadata = metadata_to_json(&alert.metadata)?;
        with_backoff(ctx, "alert.create", || async {
            sqlx::query(
                "INSERT INTO alerts \
                 (id, device_id, type, severity, message, metadata, acknowledged, \
                  acknowledged_at, acknowledged_by, created_at, resolved_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(&alert.id)
            .bind(&alert.device_id)
            .bind(alert.alert_type.as_str())
            .bind(alert.severity.as_str())
            .bind(&alert.message)
            .bind(&metadata)
            .bind(alert.acknowledged)
            .bind(alert.acknowledged_at)
            .bind(&alert.acknowledged_by)
            .bind(alert.created_at)
            .bind(alert.resolved_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("alert", e))?;
            Ok(())
        })
        .await
    }

    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Alert>> {
        ctx.run(async {
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM alerts WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("alert", e))?;
            row.as_ref().map(alert_from_row).transpose()
        })
        .await
    }

    async fn update(&self, ctx: &OpContext, alert: &Alert) -> GatewayResult<()> {
        alert.validate()?;
        let metadata = metadata_to_json(&alert.metadata)?;
        let result = ctx
            .run(async {
                sqlx::query(
                    "UPDATE alerts SET severity = $2, message = $3, metadata = $4, \
                     acknowledged = $5, acknowledged_at = $6, acknowledged_by = $7, \
                     resolved_at = $8 WHERE id = $1",
                )
                .bind(&alert.id)
                .bind(alert.severity.as_str())
                .bind(&alert.message)
                .bind(&metadata)
                .bind(alert.acknowledged)
                .bind(alert.acknowledged_at)
                .bind(&alert.acknowledged_by)
                .bind(alert.resolved_at)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("alert", e))
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("alert"));
        }
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()> {
        let result = ctx
            .run(async {
                sqlx::query("DELETE FROM alerts WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("alert", e))
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("alert"));
        }
        Ok(())
    }

    async fn list(&self, ctx: &OpContext, filter: &AlertFilter) -> GatewayResult<Vec<Alert>> {
        let (sort_col, order) = resolve_sort(&filter.filter, SORTABLE, "created_at")?;
        let (limit, offset) = clamp_page(
            &filter.filter,
            i64::from(labgw_core::limits::MAX_DEVICE_PAGE_SIZE),
        );
        ctx.run(async {
            let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM alerts"));
            push_filters(&mut qb, filter);
            qb.push(format!(" ORDER BY {sort_col} {}", order.as_sql()));
            qb.push(" LIMIT ");
            qb.push_bind(limit);
            qb.push(" OFFSET ");
            qb.push_bind(offset);

            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("alert", e))?;
            rows.iter().map(alert_from_row).collect()
        })
        .await
    }

    async fn count(&self, ctx: &OpContext, filter: &AlertFilter) -> GatewayResult<i64> {
        ctx.run(async {
            let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM alerts");
            push_filters(&mut qb, filter);
            let row = qb
                .build()
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("alert", e))?;
            row.try_get::<i64, _>(0)
                .map_err(|e| GatewayError::Internal(format!("decode count: {e}")))
        })
        .await
    }

    async fn acknowledge(
        &self,
        ctx: &OpContext,
        alert_id: &str,
        acknowledged_by: &str,
    ) -> GatewayResult<()> {
        let result = ctx
            .run(async {
                sqlx::query(
                    "UPDATE alerts SET acknowledged = TRUE, acknowledged_at = NOW(), \
                     acknowledged_by = $2 WHERE id = $1",
                )
                .bind(alert_id)
                .bind(acknowledged_by)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("alert", e))
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("alert"));
        }
        Ok(())
    }

    async fn resolve(&self, ctx: &OpContext, alert_id: &str) -> GatewayResult<()> {
        let result = ctx
            .run(async {
                sqlx::query("UPDATE alerts SET resolved_at = NOW() WHERE id = $1")
                    .bind(alert_id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("alert", e))
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("alert"));
        }
        Ok(())
    }

    async fn get_unacknowledged(&self, ctx: &OpContext) -> GatewayResult<Vec<Alert>> {
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM alerts WHERE acknowledged = FALSE \
                 ORDER BY created_at DESC"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("alert", e))?;
            rows.iter().map(alert_from_row).collect()
        })
        .await
    }

    async fn get_unresolved(&self, ctx: &OpContext) -> GatewayResult<Vec<Alert>> {
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM alerts WHERE resolved_at IS NULL \
                 ORDER BY created_at DESC"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("alert", e))?;
            rows.iter().map(alert_from_row).collect()
        })
        .await
    }

    async fn get_critical(&self, ctx: &OpContext) -> GatewayResult<Vec<Alert>> {
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM alerts \
                 WHERE severity = 'critical' AND resolved_at IS NULL \
                 ORDER BY created_at DESC"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("alert", e))?;
            rows.iter().map(alert_from_row).collect()
        })
        .await
    }

    async fn get_alert_stats(
        &self,
        ctx: &OpContext,
        range: &TimeRange,
    ) -> GatewayResult<HashMap<AlertSeverity, i64>> {
        ctx.run(async {
            let mut qb = QueryBuilder::<Postgres>::new(
                "SELECT severity, COUNT(*) AS severity_count FROM alerts WHERE 1 = 1",
            );
            if let Some(start) = range.start {
                qb.push(" AND created_at >= ");
                qb.push_bind(start);
            }
            if let Some(end) = range.end {
                qb.push(" AND created_at <= ");
                qb.push_bind(end);
            }
            qb.push(" GROUP BY severity");

            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("alert", e))?;
            let mut stats = HashMap::new();
            for row in &rows {
                let severity: String = required_string(row, "severity")?;
                let count: i64 = row
                    .try_get("severity_count")
                    .map_err(|e| GatewayError::Internal(format!("decode severity_count: {e}")))?;
                if let Some(severity) = AlertSeverity::parse(&severity) {
                    stats.insert(severity, count);
                }
            }
            Ok(stats)
        })
        .await
    }

    async fn get_alerts_by_device(
        &self,
        ctx: &OpContext,
        device_id: &str,
        limit: i64,
    ) -> GatewayResult<Vec<Alert>> {
        let limit = limit.clamp(1, i64::from(labgw_core::limits::MAX_DEVICE_PAGE_SIZE));
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM alerts WHERE device_id = $1 \
                 ORDER BY created_at DESC LIMIT $2"
            ))
            .bind(device_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("alert", e))?;
            rows.iter().map(alert_from_row).collect()
        })
        .await
    }

    async fn delete_resolved_older_than(
        &self,
        ctx: &OpContext,
        threshold: DateTime<Utc>,
    ) -> GatewayResult<i64> {
        ctx.run(async {
            let result = sqlx::query(
                "DELETE FROM alerts WHERE resolved_at IS NOT NULL AND resolved_at < $1",
            )
            .bind(threshold)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("alert", e))?;
            Ok(result.rows_affected() as i64)
        })
        .await
    }
}
