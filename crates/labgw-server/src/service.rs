//! The `LabInstrumentGateway` implementation and its lifecycle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use labgw_core::GatewayConfig;
use labgw_proto::service::{LabInstrumentGateway, StreamFrame, StreamReply};
use labgw_proto::wire::{
    GetDeviceStatusRequest, GetDeviceStatusResponse, GetMeasurementsRequest,
    GetMeasurementsResponse, HealthCheckRequest, HealthCheckResponse, ListDevicesRequest,
    ListDevicesResponse, RegisterDeviceRequest, RegisterDeviceResponse, SendCommandRequest,
    SendCommandResponse,
};
use labgw_storage::RepositoryManager;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request, Response, Status};
use tracing::info;

use crate::handlers::command::{self, CommandHandler};
use crate::handlers::health::HealthHandler;
use crate::handlers::list::{self, ListHandler};
use crate::handlers::measurements::{self, MeasurementsHandler};
use crate::handlers::register::{self, RegistrationHandler};
use crate::handlers::status::{self, StatusHandler};
use crate::pipeline::Pipeline;
use crate::registry::SessionRegistry;
use crate::stream::{DataStreamWorker, StreamConfig};
use crate::supervisor::LivenessSupervisor;

/// The assembled gateway: pipeline, handlers, registry, supervisor.
pub struct GatewayService {
    pipeline: Pipeline,
    registration: RegistrationHandler,
    status: StatusHandler,
    list: ListHandler,
    command: CommandHandler,
    measurements: MeasurementsHandler,
    health: HealthHandler,
    stream_worker: DataStreamWorker,
    registry: Arc<SessionRegistry>,
    repos: Arc<dyn RepositoryManager>,
    supervisor: Mutex<LivenessSupervisor>,
    shutdown_token: CancellationToken,
    accepting: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl GatewayService {
    pub fn new(
        repos: Arc<dyn RepositoryManager>,
        registry: Arc<SessionRegistry>,
        config: &GatewayConfig,
    ) -> Self {
        let pipeline = Pipeline::new(Some(Duration::from_secs(
            config.performance.connection_timeout_secs,
        )));
        let supervisor = LivenessSupervisor::new(
            repos.clone(),
            registry.clone(),
            config.lifecycle.clone(),
        );
        Self {
            pipeline,
            registration: RegistrationHandler::new(repos.clone(), registry.clone()),
            status: StatusHandler::new(repos.clone(), registry.clone()),
            list: ListHandler::new(repos.clone()),
            command: CommandHandler::new(repos.clone()),
            measurements: MeasurementsHandler::new(repos.clone()),
            health: HealthHandler::new(repos.clone(), registry.clone()),
            stream_worker: DataStreamWorker::new(
                repos.clone(),
                registry.clone(),
                StreamConfig::default(),
            ),
            registry,
            repos,
            supervisor: Mutex::new(supervisor),
            shutdown_token: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start background work (the supervisor). Call once after
    /// construction.
    pub async fn start(&self) {
        self.supervisor.lock().await.start();
    }

    /// Graceful shutdown: refuse new calls, give in-flight work a
    /// bounded drain window while streams are asked to close, stop the
    /// supervisor, clear the registry, and drain the pool last.
    pub async fn shutdown(&self, drain_window: Duration) {
        info!("gateway shutdown initiated");
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown_token.cancel();

        let deadline = tokio::time::Instant::now() + drain_window;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                info!(
                    remaining = self.in_flight.load(Ordering::SeqCst),
                    "drain window elapsed with calls still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        self.supervisor
            .lock()
            .await
            .stop(Duration::from_secs(5))
            .await;
        self.registry.close().await;
        if let Err(err) = self.repos.close().await {
            info!(error = %err, "repository close reported an error");
        }
        info!("gateway shutdown complete");
    }

    fn admit(&self) -> Result<InFlightGuard, Status> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Status::new(
                Code::Unavailable,
                "gateway is shutting down",
            ));
        }
        Ok(InFlightGuard::new(self.in_flight.clone()))
    }
}

/// Counts one admitted call until dropped.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tonic::async_trait]
impl LabInstrumentGateway for GatewayService {
    async fn register_device(
        &self,
        request: Request<RegisterDeviceRequest>,
    ) -> Result<Response<RegisterDeviceResponse>, Status> {
        let _guard = self.admit()?;
        let handler = &self.registration;
        self.pipeline
            .unary(
                "RegisterDevice",
                request,
                register::validate_request,
                |ctx, req| async move { handler.register(&ctx, req).await },
            )
            .await
    }

    async fn get_device_status(
        &self,
        request: Request<GetDeviceStatusRequest>,
    ) -> Result<Response<GetDeviceStatusResponse>, Status> {
        let _guard = self.admit()?;
        let handler = &self.status;
        self.pipeline
            .unary(
                "GetDeviceStatus",
                request,
                status::validate_request,
                |ctx, req| async move { handler.get_device_status(&ctx, req).await },
            )
            .await
    }

    async fn list_devices(
        &self,
        request: Request<ListDevicesRequest>,
    ) -> Result<Response<ListDevicesResponse>, Status> {
        let _guard = self.admit()?;
        let handler = &self.list;
        self.pipeline
            .unary(
                "ListDevices",
                request,
                list::validate_request,
                |ctx, req| async move { handler.list_devices(&ctx, req).await },
            )
            .await
    }

    async fn stream_data(
        &self,
        inbound: BoxStream<'static, Result<StreamFrame, Status>>,
        outbound: mpsc::Sender<Result<StreamReply, Status>>,
    ) -> Result<(), Status> {
        let _guard = self.admit()?;
        let worker = &self.stream_worker;
        self.pipeline
            .stream("StreamData", &self.shutdown_token, |ctx| async move {
                worker.run(ctx, inbound, outbound).await
            })
            .await
    }

    async fn send_command(
        &self,
        request: Request<SendCommandRequest>,
    ) -> Result<Response<SendCommandResponse>, Status> {
        let _guard = self.admit()?;
        let handler = &self.command;
        self.pipeline
            .unary(
                "SendCommand",
                request,
                command::validate_request,
                |ctx, req| async move { handler.send_command(&ctx, req).await },
            )
            .await
    }

    async fn get_measurements(
        &self,
        request: Request<GetMeasurementsRequest>,
    ) -> Result<Response<GetMeasurementsResponse>, Status> {
        let _guard = self.admit()?;
        let handler = &self.measurements;
        self.pipeline
            .unary(
                "GetMeasurements",
                request,
                measurements::validate_request,
                |ctx, req| async move { handler.get_measurements(&ctx, req).await },
            )
            .await
    }

    async fn health_check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let _guard = self.admit()?;
        let handler = &self.health;
        self.pipeline
            .unary(
                "HealthCheck",
                request,
                |_req| Ok(()),
                |ctx, req| async move { handler.health_check(&ctx, req).await },
            )
            .await
    }
}
