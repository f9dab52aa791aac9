//! The gateway service contract.
//!
//! The transport host (HTTP/2 framing, TLS, keepalive, message size caps)
//! lives outside this workspace; it dispatches decoded requests into this
//! trait and forwards the bidirectional stream as paired channels. Keeping
//! the contract transport-free lets the server and its tests drive the
//! full surface with plain tokio channels.

use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};

use crate::wire::{
    GetDeviceStatusRequest, GetDeviceStatusResponse, GetMeasurementsRequest,
    GetMeasurementsResponse, HealthCheckRequest, HealthCheckResponse, ListDevicesRequest,
    ListDevicesResponse, RegisterDeviceRequest, RegisterDeviceResponse, SendCommandRequest,
    SendCommandResponse, StreamDataRequest, StreamDataResponse,
};

/// Inbound half of a `StreamData` call.
pub type StreamFrame = StreamDataRequest;

/// Outbound half of a `StreamData` call.
pub type StreamReply = StreamDataResponse;

/// Device acknowledgment payload carried on the stream.
pub type CommandAck = crate::wire::CommandAckFrame;

/// Service definition for `lab_instrument.LabInstrumentGateway`.
#[tonic::async_trait]
pub trait LabInstrumentGateway: Send + Sync + 'static {
    /// Authenticated device upsert plus session allocation.
    async fn register_device(
        &self,
        request: Request<RegisterDeviceRequest>,
    ) -> Result<Response<RegisterDeviceResponse>, Status>;

    /// Composite status and health for one device.
    async fn get_device_status(
        &self,
        request: Request<GetDeviceStatusRequest>,
    ) -> Result<Response<GetDeviceStatusResponse>, Status>;

    /// Paged, filtered, sorted device listing with opaque cursors.
    async fn list_devices(
        &self,
        request: Request<ListDevicesRequest>,
    ) -> Result<Response<ListDevicesResponse>, Status>;

    /// Bidirectional data path: measurement ingest plus command egress.
    ///
    /// `inbound` yields frames as decoded by the transport; replies pushed
    /// into `outbound` are delivered to the device. The call returns when
    /// the stream terminates, after which the transport tears down the
    /// underlying call with the returned status.
    async fn stream_data(
        &self,
        inbound: BoxStream<'static, Result<StreamFrame, Status>>,
        outbound: mpsc::Sender<Result<StreamReply, Status>>,
    ) -> Result<(), Status>;

    /// Enqueue a command for later egress.
    async fn send_command(
        &self,
        request: Request<SendCommandRequest>,
    ) -> Result<Response<SendCommandResponse>, Status>;

    /// Historical measurement query with pagination and aggregation.
    async fn get_measurements(
        &self,
        request: Request<GetMeasurementsRequest>,
    ) -> Result<Response<GetMeasurementsResponse>, Status>;

    /// Summarize registry and persistence health.
    async fn health_check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status>;
}
