//! PostgreSQL persistence layer for the lab instrument gateway.
//!
//! Four typed repositories (devices, measurements, commands, alerts) plus
//! a manager that owns the connection pool and offers a transactional
//! combinator. The repository traits live in [`repository`]; the Postgres
//! implementations are in their own modules. Schema management is in
//! [`migrations`].
//!
//! Every operation takes an [`labgw_core::OpContext`] and honors its
//! cancellation token and deadline: work stops at the next suspension
//! point and the call fails with `Cancelled` or `DeadlineExceeded`.

pub mod alert;
pub mod command;
pub mod device;
pub mod manager;
pub mod measurement;
pub mod migrations;
pub mod pool;
pub mod repository;
mod retry;
pub mod session;
mod sql;

pub use manager::{PostgresRepositoryManager, RepositoryManager};
pub use migrations::{MigrationRunner, MigrationStatus};
pub use pool::create_pool;
pub use repository::{
    AggregationRequest, AggregationResult, AlertFilter, AlertRepository, BulkError, BulkResult,
    CommandFilter, CommandRepository, DeviceFilter, DeviceRepository, Filter, MeasurementFilter,
    MeasurementRepository, SortOrder, TimeRange,
};
pub use session::{PostgresSessionStore, SessionStore};
