//! Connection and session lifecycle engine for the lab instrument gateway.
//!
//! This crate wires the pieces together:
//! - [`registry`] - in-memory index of live device connections
//! - [`pipeline`] - correlation, validation, metrics, and panic
//!   containment around every caller-facing operation
//! - [`handlers`] - registration, status, listing, commands, measurements,
//!   health
//! - [`stream`] - the bidirectional data path (measurement ingest and
//!   command egress)
//! - [`supervisor`] - background liveness reconciliation
//! - [`service`] - the `LabInstrumentGateway` implementation plus graceful
//!   shutdown

pub mod error_mapping;
pub mod handlers;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod stream;
pub mod supervisor;

pub use error_mapping::{map_gateway_error_to_status, GatewayResultExt};
pub use registry::{RegistryStats, SessionRegistry};
pub use service::GatewayService;
pub use supervisor::LivenessSupervisor;
