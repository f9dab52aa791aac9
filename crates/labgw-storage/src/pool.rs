//! PostgreSQL connection pool construction.

use std::time::Duration;

use labgw_core::config::DatabaseConfig;
use labgw_core::{GatewayError, GatewayResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Create the connection pool with the configured caps and verify it with
/// a probe query before handing it out.
pub async fn create_pool(config: &DatabaseConfig) -> GatewayResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .connect(&config.url())
        .await
        .map_err(|e| GatewayError::unavailable_transient(format!("database connect: {e}")))?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| GatewayError::unavailable_transient(format!("database probe: {e}")))?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "database connection pool created"
    );

    Ok(pool)
}

/// Cheap liveness probe used by the health check endpoint.
pub async fn health_check(pool: &PgPool) -> GatewayResult<()> {
    let row: (i32,) = sqlx::query_as("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| GatewayError::unavailable_transient(format!("database health check: {e}")))?;
    if row.0 != 1 {
        return Err(GatewayError::Internal(
            "database health probe returned unexpected result".to_string(),
        ));
    }
    Ok(())
}
