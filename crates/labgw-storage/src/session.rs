//! Durable session rows.
//!
//! The session registry owns the live `ConnectionState`; this store keeps
//! the durable `device_sessions` row in step with it. The supersede path
//! runs in one transaction so "at most one active session per device"
//! holds in the durable record as well as in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labgw_core::model::DeviceSession;
use labgw_core::{GatewayError, GatewayResult, OpContext};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::retry::with_backoff;
use crate::sql::{
    map_sqlx_error, metadata_from_row, metadata_to_json, optional_string, required_string,
    required_timestamp,
};

const COLUMNS: &str = "id, device_id, session_id, stream_id, connected_at, last_heartbeat, \
                       metadata, is_active, close_reason";

/// Persistence contract for session rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, ctx: &OpContext, session: &DeviceSession) -> GatewayResult<()>;
    async fn get_by_session_id(
        &self,
        ctx: &OpContext,
        session_id: &str,
    ) -> GatewayResult<Option<DeviceSession>>;
    async fn get_active_for_device(
        &self,
        ctx: &OpContext,
        device_id: &str,
    ) -> GatewayResult<Option<DeviceSession>>;
    /// Mark one session inactive, recording why.
    async fn deactivate(
        &self,
        ctx: &OpContext,
        session_id: &str,
        reason: &str,
    ) -> GatewayResult<()>;
    /// Atomically close any active session for the device (reason
    /// "superseded") and insert the replacement.
    async fn supersede_and_create(
        &self,
        ctx: &OpContext,
        session: &DeviceSession,
    ) -> GatewayResult<()>;
    /// Record the stream id once a data stream attaches.
    async fn attach_stream(
        &self,
        ctx: &OpContext,
        session_id: &str,
        stream_id: &str,
    ) -> GatewayResult<()>;
    async fn update_heartbeat(
        &self,
        ctx: &OpContext,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> GatewayResult<()>;
}

pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn session_from_row(row: &PgRow) -> GatewayResult<DeviceSession> {
    Ok(DeviceSession {
        id: required_string(row, "id")?,
        device_id: required_string(row, "device_id")?,
        session_id: required_string(row, "session_id")?,
        stream_id: optional_string(row, "stream_id")?,
        connected_at: required_timestamp(row, "connected_at")?,
        last_heartbeat: required_timestamp(row, "last_heartbeat")?,
        metadata: metadata_from_row(row, "metadata")?,
        is_active: row
            .try_get("is_active")
            .map_err(|e| GatewayError::Internal(format!("decode is_active: {e}")))?,
    })
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn create(&self, ctx: &OpContext, session: &DeviceSession) -> GatewayResult<()> {
        let metadata = metadata_to_json(&session.metadata)?;
        with_backoff(ctx, "session.create", || async {
            sqlx::query(
                "INSERT INTO device_sessions \
                 (id, device_id, session_id, stream_id, connected_at, last_heartbeat, \
                  metadata, is_active) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&session.id)
            .bind(&session.device_id)
            .bind(&session.session_id)
            .bind(&session.stream_id)
            .bind(session.connected_at)
            .bind(session.last_heartbeat)
            .bind(&metadata)
            .bind(session.is_active)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("session", e))?;
            Ok(())
        })
        .await
    }

    async fn get_by_session_id(
        &self,
        ctx: &OpContext,
        session_id: &str,
    ) -> GatewayResult<Option<DeviceSession>> {
        ctx.run(async {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM device_sessions WHERE session_id = $1"
            ))
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("session", e))?;
            row.as_ref().map(session_from_row).transpose()
        })
        .await
    }

    async fn get_active_for_device(
        &self,
        ctx: &OpContext,
        device_id: &str,
    ) -> GatewayResult<Option<DeviceSession>> {
        ctx.run(async {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM device_sessions \
                 WHERE device_id = $1 AND is_active = TRUE \
                 ORDER BY connected_at DESC LIMIT 1"
            ))
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("session", e))?;
            row.as_ref().map(session_from_row).transpose()
        })
        .await
    }

    async fn deactivate(
        &self,
        ctx: &OpContext,
        session_id: &str,
        reason: &str,
    ) -> GatewayResult<()> {
        ctx.run(async {
            sqlx::query(
                "UPDATE device_sessions SET is_active = FALSE, close_reason = $2 \
                 WHERE session_id = $1 AND is_active = TRUE",
            )
            .bind(session_id)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("session", e))?;
            Ok(())
        })
        .await
    }

    async fn supersede_and_create(
        &self,
        ctx: &OpContext,
        session: &DeviceSession,
    ) -> GatewayResult<()> {
        let metadata = metadata_to_json(&session.metadata)?;
        ctx.run(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("session", e))?;

            sqlx::query(
                "UPDATE device_sessions SET is_active = FALSE, close_reason = 'superseded' \
                 WHERE device_id = $1 AND is_active = TRUE",
            )
            .bind(&session.device_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("session", e))?;

            sqlx::query(
                "INSERT INTO device_sessions \
                 (id, device_id, session_id, stream_id, connected_at, last_heartbeat, \
                  metadata, is_active) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&session.id)
            .bind(&session.device_id)
            .bind(&session.session_id)
            .bind(&session.stream_id)
            .bind(session.connected_at)
            .bind(session.last_heartbeat)
            .bind(&metadata)
            .bind(session.is_active)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("session", e))?;

            tx.commit().await.map_err(|e| map_sqlx_error("session", e))?;
            Ok(())
        })
        .await
    }

    async fn attach_stream(
        &self,
        ctx: &OpContext,
        session_id: &str,
        stream_id: &str,
    ) -> GatewayResult<()> {
        let result = ctx
            .run(async {
                sqlx::query(
                    "UPDATE device_sessions SET stream_id = $2 \
                     WHERE session_id = $1 AND is_active = TRUE",
                )
                .bind(session_id)
                .bind(stream_id)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("session", e))
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("session"));
        }
        Ok(())
    }

    async fn update_heartbeat(
        &self,
        ctx: &OpContext,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        ctx.run(async {
            sqlx::query(
                "UPDATE device_sessions SET last_heartbeat = $2 \
                 WHERE session_id = $1 AND is_active = TRUE",
            )
            .bind(session_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("session", e))?;
            Ok(())
        })
        .await
    }
}
