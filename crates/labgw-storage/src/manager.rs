//! Repository manager: one owner for the pool and all repositories.

use async_trait::async_trait;
use futures::future::BoxFuture;
use labgw_core::{GatewayResult, OpContext};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use crate::alert::PostgresAlertRepository;
use crate::command::PostgresCommandRepository;
use crate::device::PostgresDeviceRepository;
use crate::measurement::PostgresMeasurementRepository;
use crate::pool;
use crate::repository::{
    AlertRepository, CommandRepository, DeviceRepository, MeasurementRepository,
};
use crate::session::{PostgresSessionStore, SessionStore};
use crate::sql::map_sqlx_error;

/// Access to all repositories plus pool-level health and shutdown.
#[async_trait]
pub trait RepositoryManager: Send + Sync {
    fn device(&self) -> &dyn DeviceRepository;
    fn measurement(&self) -> &dyn MeasurementRepository;
    fn command(&self) -> &dyn CommandRepository;
    fn alert(&self) -> &dyn AlertRepository;
    fn session(&self) -> &dyn SessionStore;

    /// Verify pool connectivity with a probe query.
    async fn health_check(&self, ctx: &OpContext) -> GatewayResult<()>;

    /// Drain the pool. Called last during graceful shutdown.
    async fn close(&self) -> GatewayResult<()>;
}

/// Postgres-backed repository set sharing one pool.
pub struct PostgresRepositoryManager {
    pool: PgPool,
    device: PostgresDeviceRepository,
    measurement: PostgresMeasurementRepository,
    command: PostgresCommandRepository,
    alert: PostgresAlertRepository,
    session: PostgresSessionStore,
}

impl PostgresRepositoryManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            device: PostgresDeviceRepository::new(pool.clone()),
            measurement: PostgresMeasurementRepository::new(pool.clone()),
            command: PostgresCommandRepository::new(pool.clone()),
            alert: PostgresAlertRepository::new(pool.clone()),
            session: PostgresSessionStore::new(pool.clone()),
            pool,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute `f` inside one database transaction. The transaction is
    /// committed when `f` returns `Ok` and rolled back otherwise (also on
    /// cancellation, since the guard drops un-committed).
    pub async fn with_transaction<T, F>(&self, ctx: &OpContext, f: F) -> GatewayResult<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'static, Postgres>) -> BoxFuture<'t, GatewayResult<T>>
            + Send,
        T: Send,
    {
        ctx.check()?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("transaction", e))?;
        let value = ctx.run(f(&mut tx)).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("transaction", e))?;
        Ok(value)
    }
}

#[async_trait]
impl RepositoryManager for PostgresRepositoryManager {
    fn device(&self) -> &dyn DeviceRepository {
        &self.device
    }

    fn measurement(&self) -> &dyn MeasurementRepository {
        &self.measurement
    }

    fn command(&self) -> &dyn CommandRepository {
        &self.command
    }

    fn alert(&self) -> &dyn AlertRepository {
        &self.alert
    }

    fn session(&self) -> &dyn SessionStore {
        &self.session
    }

    async fn health_check(&self, ctx: &OpContext) -> GatewayResult<()> {
        ctx.run(pool::health_check(&self.pool)).await
    }

    async fn close(&self) -> GatewayResult<()> {
        info!("closing repository manager");
        self.pool.close().await;
        Ok(())
    }
}
