//! Postgres implementation of the measurement repository.
//!
//! The `measurements` table is range-partitioned by month on `timestamp`;
//! time-bounded queries prune to the covering partitions via the
//! `(device_id, timestamp DESC)` and `(type, timestamp DESC)` indexes.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use labgw_core::model::{Measurement, MeasurementBatch, MeasurementStats, QualityCode};
use labgw_core::{GatewayError, GatewayResult, OpContext};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::repository::{
    AggregationRequest, AggregationResult, BulkResult, MeasurementFilter, MeasurementRepository,
};
use crate::retry::with_backoff;
use crate::sql::{
    clamp_page, map_sqlx_error, metadata_from_row, metadata_to_json, required_string,
    required_timestamp, resolve_sort,
};

const SORTABLE: &[&str] = &["timestamp", "device_id", "type", "value", "quality", "created_at"];

const COLUMNS: &str = "id, device_id, timestamp, type, value, unit, quality, metadata, \
                       batch_id, sequence_number, created_at";

const AGGREGATION_FUNCTIONS: &[&str] = &["avg", "min", "max", "sum", "count"];

pub struct PostgresMeasurementRepository {
    pool: PgPool,
}

impl PostgresMeasurementRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_one(&self, measurement: &Measurement) -> GatewayResult<()> {
        let metadata = metadata_to_json(&measurement.metadata)?;
        sqlx::query(
            "INSERT INTO measurements \
             (id, device_id, timestamp, type, value, unit, quality, metadata, \
              batch_id, sequence_number, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&measurement.id)
        .bind(&measurement.device_id)
        .bind(measurement.timestamp)
        .bind(&measurement.measurement_type)
        .bind(measurement.value)
        .bind(&measurement.unit)
        .bind(measurement.quality.as_str())
        .bind(&metadata)
        .bind(&measurement.batch_id)
        .bind(measurement.sequence_number)
        .bind(measurement.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("measurement", e))?;
        Ok(())
    }
}

fn measurement_from_row(row: &PgRow) -> GatewayResult<Measurement> {
    let quality: String = required_string(row, "quality")?;
    Ok(Measurement {
        id: required_string(row, "id")?,
        device_id: required_string(row, "device_id")?,
        timestamp: required_timestamp(row, "timestamp")?,
        measurement_type: required_string(row, "type")?,
        value: row
            .try_get("value")
            .map_err(|e| GatewayError::Internal(format!("decode value: {e}")))?,
        unit: required_string(row, "unit")?,
        quality: QualityCode::parse(&quality),
        metadata: metadata_from_row(row, "metadata")?,
        batch_id: row
            .try_get("batch_id")
            .map_err(|e| GatewayError::Internal(format!("decode batch_id: {e}")))?,
        sequence_number: row
            .try_get("sequence_number")
            .map_err(|e| GatewayError::Internal(format!("decode sequence_number: {e}")))?,
        created_at: required_timestamp(row, "created_at")?,
    })
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &MeasurementFilter) {
    qb.push(" WHERE 1 = 1");
    if !filter.device_ids.is_empty() {
        qb.push(" AND device_id = ANY(");
        qb.push_bind(filter.device_ids.clone());
        qb.push(")");
    }
    if !filter.types.is_empty() {
        qb.push(" AND type = ANY(");
        qb.push_bind(filter.types.clone());
        qb.push(")");
    }
    if !filter.qualities.is_empty() {
        let qualities: Vec<String> = filter
            .qualities
            .iter()
            .map(|q| q.as_str().to_string())
            .collect();
        qb.push(" AND quality = ANY(");
        qb.push_bind(qualities);
        qb.push(")");
    }
    if let Some(batch_id) = &filter.batch_id {
        qb.push(" AND batch_id = ");
        qb.push_bind(batch_id.clone());
    }
    if let Some(start) = filter.time_range.start {
        qb.push(" AND timestamp >= ");
        qb.push_bind(start);
    }
    if let Some(end) = filter.time_range.end {
        qb.push(" AND timestamp <= ");
        qb.push_bind(end);
    }
}

/// First day of the month containing `(year, month)` and of the next month.
fn month_bounds(year: i32, month: u32) -> GatewayResult<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| GatewayError::validation(format!("invalid partition month {year}-{month}")))?;
    let end = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| GatewayError::validation(format!("invalid partition month {year}-{month}")))?;
    Ok((start, end))
}

#[async_trait]
impl MeasurementRepository for PostgresMeasurementRepository {
    async fn create(&self, ctx: &OpContext, measurement: &Measurement) -> GatewayResult<()> {
        measurement.validate()?;
        with_backoff(ctx, "measurement.create", || self.insert_one(measurement)).await
    }

    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Measurement>> {
        ctx.run(async {
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM measurements WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("measurement", e))?;
            row.as_ref().map(measurement_from_row).transpose()
        })
        .await
    }

    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()> {
        let result = ctx
            .run(async {
                sqlx::query("DELETE FROM measurements WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("measurement", e))
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("measurement"));
        }
        Ok(())
    }

    async fn create_bulk(
        &self,
        ctx: &OpContext,
        measurements: &[Measurement],
    ) -> GatewayResult<BulkResult> {
        let mut result = BulkResult::default();
        for (index, measurement) in measurements.iter().enumerate() {
            ctx.check()?;
            if let Err(err) = measurement.validate() {
                result.record_failure(index, err.to_string());
                continue;
            }
            match ctx.run(self.insert_one(measurement)).await {
                Ok(()) => result.record_success(),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => result.record_failure(index, err.to_string()),
            }
        }
        Ok(result)
    }

    async fn create_batch(
        &self,
        ctx: &OpContext,
        batch: &MeasurementBatch,
    ) -> GatewayResult<BulkResult> {
        if batch.measurements.is_empty() {
            return Ok(BulkResult::default());
        }
        let mut stamped = batch.clone();
        stamped.normalize();
        let result = self.create_bulk(ctx, &stamped.measurements).await?;
        if result.failure_count > 0 {
            tracing::warn!(
                batch_id = %batch.batch_id,
                device_id = %batch.device_id,
                failure_count = result.failure_count,
                "some measurements in batch failed"
            );
        }
        Ok(result)
    }

    async fn list(
        &self,
        ctx: &OpContext,
        filter: &MeasurementFilter,
    ) -> GatewayResult<Vec<Measurement>> {
        let (sort_col, order) = resolve_sort(&filter.filter, SORTABLE, "timestamp")?;
        let (limit, offset) = clamp_page(
            &filter.filter,
            i64::from(labgw_core::limits::MAX_MEASUREMENT_PAGE_SIZE),
        );
        ctx.run(async {
            let mut qb =
                QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM measurements"));
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
                .map_err(|e| map_sqlx_error("measurement", e))?;
            rows.iter().map(measurement_from_row).collect()
        })
        .await
    }

    async fn count(&self, ctx: &OpContext, filter: &MeasurementFilter) -> GatewayResult<i64> {
        ctx.run(async {
            let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM measurements");
            push_filters(&mut qb, filter);
            let row = qb
                .build()
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("measurement", e))?;
            row.try_get::<i64, _>(0)
                .map_err(|e| GatewayError::Internal(format!("decode count: {e}")))
        })
        .await
    }

    async fn get_by_time_range(
        &self,
        ctx: &OpContext,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> GatewayResult<Vec<Measurement>> {
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM measurements \
                 WHERE device_id = $1 AND timestamp >= $2 AND timestamp <= $3 \
                 ORDER BY timestamp ASC"
            ))
            .bind(device_id)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("measurement", e))?;
            rows.iter().map(measurement_from_row).collect()
        })
        .await
    }

    async fn get_latest(
        &self,
        ctx: &OpContext,
        device_id: &str,
        measurement_type: &str,
    ) -> GatewayResult<Option<Measurement>> {
        ctx.run(async {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM measurements \
                 WHERE device_id = $1 AND type = $2 \
                 ORDER BY timestamp DESC LIMIT 1"
            ))
            .bind(device_id)
            .bind(measurement_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("measurement", e))?;
            row.as_ref().map(measurement_from_row).transpose()
        })
        .await
    }

    async fn get_latest_by_device(
        &self,
        ctx: &OpContext,
        device_id: &str,
        limit: i64,
    ) -> GatewayResult<Vec<Measurement>> {
        let limit = limit.clamp(1, i64::from(labgw_core::limits::MAX_MEASUREMENT_PAGE_SIZE));
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM measurements \
                 WHERE device_id = $1 ORDER BY timestamp DESC LIMIT $2"
            ))
            .bind(device_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("measurement", e))?;
            rows.iter().map(measurement_from_row).collect()
        })
        .await
    }

    async fn aggregate(
        &self,
        ctx: &OpContext,
        request: &AggregationRequest,
    ) -> GatewayResult<Vec<AggregationResult>> {
        let function = request.aggregation_type.to_lowercase();
        if !AGGREGATION_FUNCTIONS.contains(&function.as_str()) {
            return Err(GatewayError::validation(format!(
                "invalid aggregation type: {}",
                request.aggregation_type
            )));
        }
        let aggregate_expr = if function == "count" {
            "COUNT(*)::double precision".to_string()
        } else {
            format!("{function}(value)")
        };

        let interval_secs = request.group_by_interval.as_secs();
        let bucket_expr = if interval_secs == 0 {
            "MIN(timestamp)".to_string()
        } else {
            format!(
                "to_timestamp(floor(extract(epoch FROM timestamp) / {interval_secs}) \
                 * {interval_secs})"
            )
        };

        ctx.run(async {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT device_id, type, {bucket_expr} AS bucket, \
                 {aggregate_expr} AS value, COUNT(*) AS sample_count FROM measurements"
            ));
            let filter = MeasurementFilter {
                device_ids: request.device_ids.clone(),
                types: request.types.clone(),
                time_range: request.time_range.clone(),
                ..MeasurementFilter::default()
            };
            push_filters(&mut qb, &filter);
            if interval_secs == 0 {
                qb.push(" GROUP BY device_id, type");
            } else {
                qb.push(" GROUP BY device_id, type, bucket");
            }
            qb.push(" ORDER BY bucket ASC");

            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("measurement", e))?;
            rows.iter()
                .map(|row| {
                    Ok(AggregationResult {
                        device_id: required_string(row, "device_id")?,
                        measurement_type: required_string(row, "type")?,
                        timestamp: required_timestamp(row, "bucket")?,
                        value: row
                            .try_get("value")
                            .map_err(|e| GatewayError::Internal(format!("decode value: {e}")))?,
                        count: row.try_get("sample_count").map_err(|e| {
                            GatewayError::Internal(format!("decode sample_count: {e}"))
                        })?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn get_statistics(
        &self,
        ctx: &OpContext,
        filter: &MeasurementFilter,
    ) -> GatewayResult<MeasurementStats> {
        ctx.run(async {
            let mut qb = QueryBuilder::<Postgres>::new(
                "SELECT COUNT(*) AS sample_count, \
                 COALESCE(MIN(value), 0) AS min_value, \
                 COALESCE(MAX(value), 0) AS max_value, \
                 COALESCE(AVG(value), 0) AS avg_value, \
                 COALESCE(STDDEV_POP(value), 0) AS std_dev, \
                 MIN(timestamp) AS earliest_time, \
                 MAX(timestamp) AS latest_time, \
                 COUNT(*) FILTER (WHERE quality = 'good') AS good_count, \
                 COUNT(*) FILTER (WHERE quality = 'bad') AS bad_count \
                 FROM measurements",
            );
            push_filters(&mut qb, filter);

            let row = qb
                .build()
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("measurement", e))?;

            let decode = |col: &str| -> GatewayResult<f64> {
                row.try_get(col)
                    .map_err(|e| GatewayError::Internal(format!("decode {col}: {e}")))
            };
            Ok(MeasurementStats {
                device_id: filter.device_ids.first().cloned().unwrap_or_default(),
                measurement_type: filter.types.first().cloned().unwrap_or_default(),
                count: row
                    .try_get("sample_count")
                    .map_err(|e| GatewayError::Internal(format!("decode sample_count: {e}")))?,
                min_value: decode("min_value")?,
                max_value: decode("max_value")?,
                avg_value: decode("avg_value")?,
                std_dev: decode("std_dev")?,
                earliest_time: row
                    .try_get("earliest_time")
                    .map_err(|e| GatewayError::Internal(format!("decode earliest_time: {e}")))?,
                latest_time: row
                    .try_get("latest_time")
                    .map_err(|e| GatewayError::Internal(format!("decode latest_time: {e}")))?,
                good_quality_count: row
                    .try_get("good_count")
                    .map_err(|e| GatewayError::Internal(format!("decode good_count: {e}")))?,
                bad_quality_count: row
                    .try_get("bad_count")
                    .map_err(|e| GatewayError::Internal(format!("decode bad_count: {e}")))?,
            })
        })
        .await
    }

    async fn delete_older_than(
        &self,
        ctx: &OpContext,
        threshold: DateTime<Utc>,
    ) -> GatewayResult<i64> {
        ctx.run(async {
            let result = sqlx::query("DELETE FROM measurements WHERE timestamp < $1")
                .bind(threshold)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("measurement", e))?;
            Ok(result.rows_affected() as i64)
        })
        .await
    }

    async fn delete_by_device(&self, ctx: &OpContext, device_id: &str) -> GatewayResult<i64> {
        ctx.run(async {
            let result = sqlx::query("DELETE FROM measurements WHERE device_id = $1")
                .bind(device_id)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("measurement", e))?;
            Ok(result.rows_affected() as i64)
        })
        .await
    }

    async fn ensure_partition(&self, ctx: &OpContext, year: i32, month: u32) -> GatewayResult<()> {
        let (start, end) = month_bounds(year, month)?;
        // Partition DDL cannot use bind parameters; bounds come from a
        // validated NaiveDate, not caller input.
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS measurements_y{:04}m{:02} \
             PARTITION OF measurements FOR VALUES FROM ('{}') TO ('{}')",
            year, month, start, end
        );
        ctx.run(async {
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("measurement", e))?;
            Ok(())
        })
        .await
    }
}

/// Months to pre-create, starting at `from` and walking `lookahead` months
/// forward. Used by the supervisor.
pub fn partition_months(from: DateTime<Utc>, lookahead: u32) -> Vec<(i32, u32)> {
    let mut months = Vec::with_capacity(lookahead as usize + 1);
    let mut year = from.year();
    let mut month = from.month();
    for _ in 0..=lookahead {
        months.push((year, month));
        month += 1;
        if month > 12 {
            month = 1;
            year += 1;
        }
    }
    months
}
