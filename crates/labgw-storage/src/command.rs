//! Postgres implementation of the command repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labgw_core::model::{Command, CommandStatus};
use labgw_core::{GatewayError, GatewayResult, OpContext};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::repository::{CommandFilter, CommandRepository, TimeRange};
use crate::retry::with_backoff;
use crate::sql::{
    clamp_page, map_sqlx_error, metadata_from_row, metadata_to_json, optional_string,
    optional_timestamp, required_string, required_timestamp, resolve_sort,
};

const SORTABLE: &[&str] = &[
    "submitted_at",
    "priority",
    "status",
    "type",
    "device_id",
    "expires_at",
    "completed_at",
];

const COLUMNS: &str = "id, device_id, command_id, type, parameters, status, priority, \
                       timeout_seconds, result, error_message, submitted_at, executed_at, \
                       completed_at, expires_at, execution_time_ms, created_at, updated_at";

pub struct PostgresCommandRepository {
    pool: PgPool,
}

impl PostgresCommandRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn command_from_row(row: &PgRow) -> GatewayResult<Command> {
    let status: String = required_string(row, "status")?;
    Ok(Command {
        id: required_string(row, "id")?,
        device_id: required_string(row, "device_id")?,
        command_id: required_string(row, "command_id")?,
        command_type: required_string(row, "type")?,
        parameters: metadata_from_row(row, "parameters")?,
        status: CommandStatus::parse(&status),
        priority: row
            .try_get("priority")
            .map_err(|e| GatewayError::Internal(format!("decode priority: {e}")))?,
        timeout_seconds: row
            .try_get("timeout_seconds")
            .map_err(|e| GatewayError::Internal(format!("decode timeout_seconds: {e}")))?,
        result: metadata_from_row(row, "result")?,
        error_message: optional_string(row, "error_message")?,
        submitted_at: required_timestamp(row, "submitted_at")?,
        executed_at: optional_timestamp(row, "executed_at")?,
        completed_at: optional_timestamp(row, "completed_at")?,
        expires_at: optional_timestamp(row, "expires_at")?,
        execution_time_ms: row
            .try_get("execution_time_ms")
            .map_err(|e| GatewayError::Internal(format!("decode execution_time_ms: {e}")))?,
        created_at: required_timestamp(row, "created_at")?,
        updated_at: required_timestamp(row, "updated_at")?,
    })
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &CommandFilter) {
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
    if let Some(start) = filter.time_range.start {
        qb.push(" AND submitted_at >= ");
        qb.push_bind(start);
    }
    if let Some(end) = filter.time_range.end {
        qb.push(" AND submitted_at <= ");
        qb.push_bind(end);
    }
}

#[async_trait]
impl CommandRepository for PostgresCommandRepository {
    async fn create(&self, ctx: &OpContext, command: &Command) -> GatewayResult<()> {
        command.validate()?;
        let parameters = metadata_to_json(&command.parameters)?;
        let result = metadata_to_json(&command.result)?;
        with_backoff(ctx, "command.create", || async {
            sqlx::query(
                "INSERT INTO commands \
                 (id, device_id, command_id, type, parameters, status, priority, \
                  timeout_seconds, result, error_message, submitted_at, executed_at, \
                  completed_at, expires_at, execution_time_ms, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
                         $15, $16, $17)",
            )
            .bind(&command.id)
            .bind(&command.device_id)
            .bind(&command.command_id)
            .bind(&command.command_type)
            .bind(&parameters)
            .bind(command.status.as_str())
            .bind(command.priority)
            .bind(command.timeout_seconds)
            .bind(&result)
            .bind(&command.error_message)
            .bind(command.submitted_at)
            .bind(command.executed_at)
            .bind(command.completed_at)
            .bind(command.expires_at)
            .bind(command.execution_time_ms)
            .bind(command.created_at)
            .bind(command.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("command", e))?;
            Ok(())
        })
        .await
    }

    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Command>> {
        ctx.run(async {
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM commands WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("command", e))?;
            row.as_ref().map(command_from_row).transpose()
        })
        .await
    }

    async fn get_by_command_id(
        &self,
        ctx: &OpContext,
        command_id: &str,
    ) -> GatewayResult<Option<Command>> {
        ctx.run(async {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM commands WHERE command_id = $1"
            ))
            .bind(command_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("command", e))?;
            row.as_ref().map(command_from_row).transpose()
        })
        .await
    }

    async fn update(&self, ctx: &OpContext, command: &Command) -> GatewayResult<()> {
        command.validate()?;
        let parameters = metadata_to_json(&command.parameters)?;
        let result_json = metadata_to_json(&command.result)?;
        let result = ctx
            .run(async {
                sqlx::query(
                    "UPDATE commands SET status = $2, parameters = $3, result = $4, \
                     error_message = $5, executed_at = $6, completed_at = $7, \
                     execution_time_ms = $8, updated_at = $9 \
                     WHERE command_id = $1",
                )
                .bind(&command.command_id)
                .bind(command.status.as_str())
                .bind(&parameters)
                .bind(&result_json)
                .bind(&command.error_message)
                .bind(command.executed_at)
                .bind(command.completed_at)
                .bind(command.execution_time_ms)
                .bind(command.updated_at)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("command", e))
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("command"));
        }
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()> {
        let result = ctx
            .run(async {
                sqlx::query("DELETE FROM commands WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("command", e))
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("command"));
        }
        Ok(())
    }

    async fn list(&self, ctx: &OpContext, filter: &CommandFilter) -> GatewayResult<Vec<Command>> {
        let (sort_col, order) = resolve_sort(&filter.filter, SORTABLE, "submitted_at")?;
        let (limit, offset) = clamp_page(
            &filter.filter,
            i64::from(labgw_core::limits::MAX_DEVICE_PAGE_SIZE),
        );
        ctx.run(async {
            let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM commands"));
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
                .map_err(|e| map_sqlx_error("command", e))?;
            rows.iter().map(command_from_row).collect()
        })
        .await
    }

    async fn count(&self, ctx: &OpContext, filter: &CommandFilter) -> GatewayResult<i64> {
        ctx.run(async {
            let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM commands");
            push_filters(&mut qb, filter);
            let row = qb
                .build()
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("command", e))?;
            row.try_get::<i64, _>(0)
                .map_err(|e| GatewayError::Internal(format!("decode count: {e}")))
        })
        .await
    }

    async fn get_pending(&self, ctx: &OpContext, device_id: &str) -> GatewayResult<Vec<Command>> {
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM commands \
                 WHERE device_id = $1 AND status = 'pending' \
                 AND (expires_at IS NULL OR expires_at > NOW()) \
                 ORDER BY priority DESC, submitted_at ASC"
            ))
            .bind(device_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("command", e))?;
            rows.iter().map(command_from_row).collect()
        })
        .await
    }

    async fn get_executing(
        &self,
        ctx: &OpContext,
        device_id: &str,
    ) -> GatewayResult<Vec<Command>> {
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM commands \
                 WHERE device_id = $1 AND status = 'executing' \
                 ORDER BY executed_at ASC"
            ))
            .bind(device_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("command", e))?;
            rows.iter().map(command_from_row).collect()
        })
        .await
    }

    async fn update_status(
        &self,
        ctx: &OpContext,
        command_id: &str,
        status: CommandStatus,
    ) -> GatewayResult<()> {
        // Terminal states stamp completed_at; executing stamps executed_at.
        let sql = match status {
            CommandStatus::Executing => {
                "UPDATE commands SET status = $2, executed_at = NOW(), updated_at = NOW() \
                 WHERE command_id = $1"
            }
            s if s.is_terminal() => {
                "UPDATE commands SET status = $2, completed_at = NOW(), updated_at = NOW() \
                 WHERE command_id = $1"
            }
            _ => "UPDATE commands SET status = $2, updated_at = NOW() WHERE command_id = $1",
        };
        let result = with_backoff(ctx, "command.update_status", || async {
            sqlx::query(sql)
                .bind(command_id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("command", e))
        })
        .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("command"));
        }
        Ok(())
    }

    async fn get_expired(&self, ctx: &OpContext) -> GatewayResult<Vec<Command>> {
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM commands \
                 WHERE status IN ('pending', 'executing') AND expires_at <= NOW() \
                 ORDER BY expires_at ASC"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("command", e))?;
            rows.iter().map(command_from_row).collect()
        })
        .await
    }

    async fn mark_expired_as_timeout(&self, ctx: &OpContext) -> GatewayResult<Vec<Command>> {
        ctx.run(async {
            let rows = sqlx::query(&format!(
                "UPDATE commands SET status = 'timeout', \
                 error_message = 'command execution timed out', \
                 completed_at = NOW(), updated_at = NOW() \
                 WHERE status IN ('pending', 'executing') AND expires_at <= NOW() \
                 RETURNING {COLUMNS}"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("command", e))?;
            rows.iter().map(command_from_row).collect()
        })
        .await
    }

    async fn delete_completed_older_than(
        &self,
        ctx: &OpContext,
        threshold: DateTime<Utc>,
    ) -> GatewayResult<i64> {
        ctx.run(async {
            let result = sqlx::query(
                "DELETE FROM commands \
                 WHERE status IN ('completed', 'failed', 'timeout', 'cancelled') \
                 AND completed_at < $1",
            )
            .bind(threshold)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("command", e))?;
            Ok(result.rows_affected() as i64)
        })
        .await
    }

    async fn get_command_stats(
        &self,
        ctx: &OpContext,
        device_id: &str,
        range: &TimeRange,
    ) -> GatewayResult<HashMap<CommandStatus, i64>> {
        ctx.run(async {
            let mut qb = QueryBuilder::<Postgres>::new(
                "SELECT status, COUNT(*) AS status_count FROM commands WHERE device_id = ",
            );
            qb.push_bind(device_id.to_string());
            if let Some(start) = range.start {
                qb.push(" AND submitted_at >= ");
                qb.push_bind(start);
            }
            if let Some(end) = range.end {
                qb.push(" AND submitted_at <= ");
                qb.push_bind(end);
            }
            qb.push(" GROUP BY status");

            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("command", e))?;
            let mut stats = HashMap::new();
            for row in &rows {
                let status: String = required_string(row, "status")?;
                let count: i64 = row
                    .try_get("status_count")
                    .map_err(|e| GatewayError::Internal(format!("decode status_count: {e}")))?;
                stats.insert(CommandStatus::parse(&status), count);
            }
            Ok(stats)
        })
        .await
    }
}
