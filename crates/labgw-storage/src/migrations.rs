//! Embedded schema migrations.
//!
//! Migration SQL ships inside the binary via `include_str!`, so the
//! administrative CLI needs no files on disk. Applied versions are
//! recorded in `schema_migrations` together with a SHA-256 checksum;
//! `validate` compares recorded checksums against the embedded SQL to
//! catch drift between the binary and the database.

use chrono::{DateTime, Utc};
use labgw_core::{GatewayError, GatewayResult, OpContext};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use tracing::info;

/// One migration step.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i32,
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sql.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// The full ordered migration set.
pub fn all() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "initial_schema",
            sql: include_str!("../migrations/001_initial_schema.sql"),
        },
        Migration {
            version: 2,
            name: "measurements",
            sql: include_str!("../migrations/002_measurements.sql"),
        },
    ]
}

/// Status of one migration as reported by `status`.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub version: i32,
    pub name: String,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Summary returned by [`MigrationRunner::status`].
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub current_version: i32,
    pub applied_count: usize,
    pub pending_count: usize,
    pub migrations: Vec<MigrationRecord>,
}

/// Applies, reports, and validates migrations.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tracking table if missing.
    pub async fn initialize(&self, ctx: &OpContext) -> GatewayResult<()> {
        ctx.run(async {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS schema_migrations (\
                     version INTEGER PRIMARY KEY, \
                     name VARCHAR(255) NOT NULL, \
                     checksum VARCHAR(64) NOT NULL, \
                     applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW())",
            )
            .execute(&self.pool)
            .await
            .map_err(|e| {
                GatewayError::unavailable_permanent(format!("initialize migrations: {e}"))
            })?;
            Ok(())
        })
        .await
    }

    async fn applied_versions(&self) -> GatewayResult<Vec<(i32, String, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT version, checksum, applied_at FROM schema_migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::unavailable_permanent(format!("read migrations: {e}")))?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<i32, _>("version")
                        .map_err(|e| GatewayError::Internal(e.to_string()))?,
                    row.try_get::<String, _>("checksum")
                        .map_err(|e| GatewayError::Internal(e.to_string()))?,
                    row.try_get::<DateTime<Utc>, _>("applied_at")
                        .map_err(|e| GatewayError::Internal(e.to_string()))?,
                ))
            })
            .collect()
    }

    /// Apply every pending migration in order, each inside its own
    /// transaction. Returns the number applied.
    pub async fn up(&self, ctx: &OpContext) -> GatewayResult<usize> {
        self.initialize(ctx).await?;
        let applied = self.applied_versions().await?;
        let mut count = 0;
        for migration in all() {
            ctx.check()?;
            if applied.iter().any(|(v, _, _)| *v == migration.version) {
                continue;
            }
            info!(
                version = migration.version,
                name = migration.name,
                "applying migration"
            );
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| GatewayError::unavailable_permanent(format!("migration tx: {e}")))?;
            sqlx::raw_sql(migration.sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    GatewayError::unavailable_permanent(format!(
                        "migration {} failed: {e}",
                        migration.version
                    ))
                })?;
            sqlx::query(
                "INSERT INTO schema_migrations (version, name, checksum) VALUES ($1, $2, $3)",
            )
            .bind(migration.version)
            .bind(migration.name)
            .bind(migration.checksum())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                GatewayError::unavailable_permanent(format!(
                    "record migration {}: {e}",
                    migration.version
                ))
            })?;
            tx.commit()
                .await
                .map_err(|e| GatewayError::unavailable_permanent(format!("migration commit: {e}")))?;
            count += 1;
        }
        Ok(count)
    }

    /// Report current version plus the applied/pending breakdown.
    pub async fn status(&self, ctx: &OpContext) -> GatewayResult<MigrationStatus> {
        self.initialize(ctx).await?;
        let applied = self.applied_versions().await?;
        let mut records = Vec::new();
        let mut current_version = 0;
        let mut applied_count = 0;
        let mut pending_count = 0;
        for migration in all() {
            let applied_at = applied
                .iter()
                .find(|(v, _, _)| *v == migration.version)
                .map(|(_, _, at)| *at);
            if applied_at.is_some() {
                applied_count += 1;
                current_version = migration.version;
            } else {
                pending_count += 1;
            }
            records.push(MigrationRecord {
                version: migration.version,
                name: migration.name.to_string(),
                applied_at,
            });
        }
        Ok(MigrationStatus {
            current_version,
            applied_count,
            pending_count,
            migrations: records,
        })
    }

    /// Compare recorded checksums against the embedded SQL.
    pub async fn validate(&self, ctx: &OpContext) -> GatewayResult<()> {
        self.initialize(ctx).await?;
        let applied = self.applied_versions().await?;
        for (version, recorded_checksum, _) in &applied {
            let Some(migration) = all().into_iter().find(|m| m.version == *version) else {
                return Err(GatewayError::Internal(format!(
                    "database has migration {version} that this binary does not know"
                )));
            };
            let expected = migration.checksum();
            if *recorded_checksum != expected {
                return Err(GatewayError::Internal(format!(
                    "checksum mismatch for migration {version} ({}): recorded {recorded_checksum}, embedded {expected}",
                    migration.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        let migrations = all();
        assert!(!migrations.is_empty());
        for window in migrations.windows(2) {
            assert!(window[0].version < window[1].version);
        }
    }

    #[test]
    fn test_checksum_is_stable_and_content_sensitive() {
        let a = Migration {
            version: 1,
            name: "a",
            sql: "CREATE TABLE t (id INT)",
        };
        let b = Migration {
            version: 1,
            name: "a",
            sql: "CREATE TABLE t (id BIGINT)",
        };
        assert_eq!(a.checksum(), a.checksum());
        assert_ne!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[test]
    fn test_embedded_sql_mentions_all_tables() {
        let combined: String = all().iter().map(|m| m.sql).collect();
        for table in [
            "devices",
            "device_sessions",
            "measurements",
            "commands",
            "alerts",
        ] {
            assert!(combined.contains(table), "missing table {table}");
        }
    }
}
