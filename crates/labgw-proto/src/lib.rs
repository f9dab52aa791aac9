//! Wire types and service contract for the lab instrument gateway.
//!
//! This crate contains:
//! - Prost message and enum types for the `lab_instrument` protocol,
//!   maintained in-tree in [`wire`]
//! - Conversion functions between wire types and domain types in
//!   [`convert`]
//! - The [`service::LabInstrumentGateway`] trait that the server
//!   implements and the transport layer dispatches into
//!
//! # Architecture
//!
//! The wire types are kept separate from domain types to:
//! - Avoid transport-layer coupling in domain code
//! - Provide clear boundaries for type conversions
//! - Let the transport host (TLS, keepalive, HTTP/2 framing) evolve
//!   independently of the gateway core

#![allow(missing_docs)] // Wire types mirror the protocol schema

pub mod convert;
pub mod service;
pub mod wire;

pub use service::{CommandAck, LabInstrumentGateway, StreamFrame, StreamReply};
pub use wire::*;
