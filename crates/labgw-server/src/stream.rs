//! Bidirectional data path: measurement ingest and command egress.
//!
//! A stream may only attach when the registry holds an active entry for
//! the device and the presented session id matches the device's current
//! session; anything else is refused with `FailedPrecondition`.
//!
//! Ingest and egress each run on their own task with bounded queues.
//! When the ingest queue fills, the main loop blocks on `send`, which
//! stops reading inbound frames and pushes backpressure down to the
//! transport; nothing is dropped silently. When the egress queue fills,
//! pending commands simply stay `pending` and are retried on the next
//! poll. Both helpers are joined on termination, after a final flush.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use labgw_core::model::{Alert, AlertSeverity, AlertType, CommandStatus, Measurement, Metadata};
use labgw_core::{GatewayError, GatewayResult, OpContext};
use labgw_proto::convert::ToDomain;
use labgw_proto::wire::{
    stream_data_request, stream_data_response, CommandFrame, IngestAck, StreamAttach,
};
use labgw_proto::{StreamFrame, StreamReply};
use labgw_storage::{MeasurementRepository, RepositoryManager};
use prost::Message as _;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::handlers::command::CommandHandler;
use crate::metrics::METRICS;
use crate::registry::SessionRegistry;

/// Tuning knobs for one data stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Flush the ingest buffer at this many samples.
    pub batch_size: usize,
    /// Flush the ingest buffer at least this often.
    pub batch_window: Duration,
    /// Depth of the bounded ingest queue.
    pub queue_depth: usize,
    /// How often egress polls for pending commands.
    pub egress_poll_interval: Duration,
    /// Ingest failures beyond this raise a `data_quality` alert.
    pub error_alert_threshold: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_window: Duration::from_secs(1),
            queue_depth: 256,
            egress_poll_interval: Duration::from_millis(500),
            error_alert_threshold: 10,
        }
    }
}

pub struct DataStreamWorker {
    repos: Arc<dyn RepositoryManager>,
    registry: Arc<SessionRegistry>,
    config: StreamConfig,
}

impl DataStreamWorker {
    pub fn new(
        repos: Arc<dyn RepositoryManager>,
        registry: Arc<SessionRegistry>,
        config: StreamConfig,
    ) -> Self {
        Self {
            repos,
            registry,
            config,
        }
    }

    /// Drive one stream until the device disconnects, the caller
    /// cancels, or an unrecoverable error occurs.
    pub async fn run(
        &self,
        ctx: OpContext,
        mut inbound: BoxStream<'static, Result<StreamFrame, Status>>,
        outbound: mpsc::Sender<Result<StreamReply, Status>>,
    ) -> GatewayResult<()> {
        // The first frame must be an attach.
        let attach = match inbound.next().await {
            Some(Ok(frame)) => match frame.payload {
                Some(stream_data_request::Payload::Attach(attach)) => attach,
                _ => {
                    return Err(GatewayError::FailedPrecondition(
                        "first stream frame must be an attach".to_string(),
                    ))
                }
            },
            Some(Err(status)) => {
                return Err(GatewayError::Internal(format!(
                    "stream failed before attach: {status}"
                )))
            }
            None => return Ok(()),
        };
        let device_id = attach.device_id.clone();
        let stream_id = self.attach(&ctx, &attach).await?;

        info!(
            correlation_id = ctx.correlation_id(),
            device_id = %device_id,
            stream_id = %stream_id,
            "data stream attached"
        );

        let token = ctx.cancellation_token().child_token();

        let (ingest_tx, ingest_rx) = mpsc::channel::<Measurement>(self.config.queue_depth);
        let ingest = self.spawn_ingest(
            device_id.clone(),
            ingest_rx,
            outbound.clone(),
            token.clone(),
        );
        let egress = self.spawn_egress(device_id.clone(), outbound.clone(), token.clone());

        let command_handler = CommandHandler::new(self.repos.clone());
        let mut close_reason = "stream closed by device".to_string();

        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => {
                    close_reason = "caller cancelled".to_string();
                    break;
                }
                frame = inbound.next() => frame,
            };
            match frame {
                Some(Ok(frame)) => {
                    if let Err(err) = self
                        .handle_frame(&ctx, &command_handler, &device_id, frame, &ingest_tx)
                        .await
                    {
                        if err.is_cancellation() {
                            close_reason = "caller cancelled".to_string();
                            break;
                        }
                        // Bad frames mark the connection unhealthy but do
                        // not kill the stream.
                        let _ = self.registry.record_error(&device_id, &err.to_string()).await;
                        warn!(device_id = %device_id, error = %err, "stream frame rejected");
                    }
                }
                Some(Err(status)) => {
                    close_reason = format!("transport error: {status}");
                    break;
                }
                None => break,
            }
        }

        // Shut the helpers down: dropping the ingest sender triggers the
        // final flush, the token stops egress. Join both before
        // disconnecting so no work runs against a torn-down stream.
        drop(ingest_tx);
        token.cancel();
        let _ = ingest.await;
        let _ = egress.await;

        if let Err(err) = self.registry.disconnect(&device_id, &close_reason).await {
            debug!(device_id = %device_id, error = %err, "disconnect after stream close");
        }
        info!(device_id = %device_id, reason = %close_reason, "data stream closed");
        Ok(())
    }

    /// Validate the attach frame against the registry and record the
    /// stream id on both the live entry and the durable session row.
    async fn attach(&self, ctx: &OpContext, attach: &StreamAttach) -> GatewayResult<String> {
        let connection = self
            .registry
            .get(&attach.device_id)
            .await
            .filter(|conn| conn.is_connected)
            .ok_or_else(|| {
                GatewayError::FailedPrecondition(format!(
                    "device {} has no active registration",
                    attach.device_id
                ))
            })?;
        if connection.session_id != attach.session_id {
            return Err(GatewayError::FailedPrecondition(format!(
                "session {} is not the active session for device {}",
                attach.session_id, attach.device_id
            )));
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let session_id = self
            .registry
            .attach_stream(&attach.device_id, &stream_id)
            .await?;
        if let Err(err) = self
            .repos
            .session()
            .attach_stream(ctx, &session_id, &stream_id)
            .await
        {
            warn!(
                device_id = %attach.device_id,
                error = %err,
                "failed to persist stream attachment"
            );
        }
        Ok(stream_id)
    }

    async fn handle_frame(
        &self,
        ctx: &OpContext,
        command_handler: &CommandHandler,
        device_id: &str,
        frame: StreamFrame,
        ingest_tx: &mpsc::Sender<Measurement>,
    ) -> GatewayResult<()> {
        match frame.payload {
            Some(stream_data_request::Payload::Measurement(point)) => {
                if point.device_id != device_id {
                    return Err(GatewayError::validation(
                        "measurement device_id does not match stream",
                    ));
                }
                let bytes = point.encoded_len() as i64;
                METRICS
                    .stream_messages_total
                    .with_label_values(&["StreamData", "received"])
                    .inc();
                self.registry
                    .update_stats(device_id, 0, 1, 0, bytes)
                    .await?;
                // Any valid data frame counts as a heartbeat.
                self.registry.update_heartbeat(device_id, None).await?;

                let measurement = point.to_domain();
                ingest_tx
                    .send(measurement)
                    .await
                    .map_err(|_| GatewayError::Internal("ingest queue closed".to_string()))?;
                Ok(())
            }
            Some(stream_data_request::Payload::Heartbeat(heartbeat)) => {
                let metrics: Metadata = heartbeat
                    .metrics
                    .iter()
                    .map(|(k, v)| (k.clone(), (*v).into()))
                    .collect();
                self.registry
                    .update_heartbeat(device_id, Some(metrics))
                    .await?;
                if let Some(conn) = self.registry.get(device_id).await {
                    if let Err(err) = self
                        .repos
                        .session()
                        .update_heartbeat(ctx, &conn.session_id, Utc::now())
                        .await
                    {
                        debug!(device_id, error = %err, "heartbeat persist failed");
                    }
                }
                Ok(())
            }
            Some(stream_data_request::Payload::CommandAck(ack)) => {
                METRICS
                    .stream_messages_total
                    .with_label_values(&["StreamData", "received"])
                    .inc();
                self.registry.update_stats(device_id, 0, 1, 0, 0).await?;
                self.registry.update_heartbeat(device_id, None).await?;
                command_handler.handle_ack(ctx, &ack).await
            }
            Some(stream_data_request::Payload::Attach(_)) => Err(GatewayError::validation(
                "stream is already attached",
            )),
            None => Err(GatewayError::validation("empty stream frame")),
        }
    }

    /// Ingest helper: buffer samples and flush on size, window, or close.
    fn spawn_ingest(
        &self,
        device_id: String,
        mut rx: mpsc::Receiver<Measurement>,
        outbound: mpsc::Sender<Result<StreamReply, Status>>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let repos = self.repos.clone();
        let registry = self.registry.clone();
        let batch_size = self.config.batch_size;
        let batch_window = self.config.batch_window;
        let error_alert_threshold = self.config.error_alert_threshold;

        tokio::spawn(async move {
            let mut buffer: Vec<Measurement> = Vec::with_capacity(batch_size);
            let mut window = tokio::time::interval(batch_window);
            window.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut error_count = 0usize;
            let mut alert_raised = false;

            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(measurement) => {
                            buffer.push(measurement);
                            if buffer.len() >= batch_size {
                                flush_batch(
                                    repos.measurement(),
                                    &registry,
                                    &device_id,
                                    &mut buffer,
                                    &outbound,
                                    &mut error_count,
                                )
                                .await;
                            }
                        }
                        // Sender dropped: stream is closing, final flush.
                        None => break,
                    },
                    _ = window.tick() => {
                        if !buffer.is_empty() {
                            flush_batch(
                                repos.measurement(),
                                &registry,
                                &device_id,
                                &mut buffer,
                                &outbound,
                                &mut error_count,
                            )
                            .await;
                        }
                    }
                    _ = token.cancelled() => break,
                }

                if error_count > error_alert_threshold && !alert_raised {
                    alert_raised = true;
                    raise_data_quality_alert(&repos, &device_id, error_count).await;
                }
            }

            // Drain whatever arrived before the close, then flush once.
            while let Ok(measurement) = rx.try_recv() {
                buffer.push(measurement);
            }
            if !buffer.is_empty() {
                flush_batch(
                    repos.measurement(),
                    &registry,
                    &device_id,
                    &mut buffer,
                    &outbound,
                    &mut error_count,
                )
                .await;
            }
            if error_count > error_alert_threshold && !alert_raised {
                raise_data_quality_alert(&repos, &device_id, error_count).await;
            }
        })
    }

    /// Egress helper: deliver pending commands, highest priority first.
    fn spawn_egress(
        &self,
        device_id: String,
        outbound: mpsc::Sender<Result<StreamReply, Status>>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let repos = self.repos.clone();
        let registry = self.registry.clone();
        let poll_interval = self.config.egress_poll_interval;

        tokio::spawn(async move {
            let ctx = OpContext::background(&token);
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let pending = match repos.command().get_pending(&ctx, &device_id).await {
                    Ok(pending) => pending,
                    Err(err) if err.is_cancellation() => break,
                    Err(err) => {
                        warn!(device_id = %device_id, error = %err, "egress poll failed");
                        continue;
                    }
                };

                for command in pending {
                    // Bounded queue: when full, leave the command pending
                    // and retry on the next poll.
                    let permit = match outbound.try_reserve() {
                        Ok(permit) => permit,
                        Err(mpsc::error::TrySendError::Full(_)) => break,
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    };

                    let frame = CommandFrame::from(&command);
                    let bytes = frame.encoded_len() as i64;
                    permit.send(Ok(StreamReply {
                        payload: Some(stream_data_response::Payload::Command(frame)),
                    }));

                    METRICS
                        .stream_messages_total
                        .with_label_values(&["StreamData", "sent"])
                        .inc();
                    let _ = registry.update_stats(&device_id, 1, 0, bytes, 0).await;

                    match repos
                        .command()
                        .update_status(&ctx, &command.command_id, CommandStatus::Executing)
                        .await
                    {
                        Ok(()) => {
                            METRICS
                                .commands_delivered_total
                                .with_label_values(&["delivered"])
                                .inc();
                        }
                        Err(err) => {
                            METRICS
                                .commands_delivered_total
                                .with_label_values(&["transition_failed"])
                                .inc();
                            warn!(
                                command_id = %command.command_id,
                                error = %err,
                                "failed to mark command executing"
                            );
                        }
                    }
                }
            }
        })
    }
}

/// Flush the buffer as one batch. Failed samples are reported through the
/// per-stream error counter; the buffer is consumed either way (the
/// client owns retries, per the durability contract).
async fn flush_batch(
    measurements: &dyn MeasurementRepository,
    registry: &SessionRegistry,
    device_id: &str,
    buffer: &mut Vec<Measurement>,
    outbound: &mpsc::Sender<Result<StreamReply, Status>>,
    error_count: &mut usize,
) {
    let batch = labgw_core::model::MeasurementBatch {
        device_id: device_id.to_string(),
        batch_id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        measurements: std::mem::take(buffer),
    };
    let batch_id = batch.batch_id.clone();
    let submitted = batch.measurements.len();

    let ctx = OpContext::new();
    let timer = std::time::Instant::now();
    match measurements.create_batch(&ctx, &batch).await {
        Ok(result) => {
            METRICS
                .ingest_flush_duration_seconds
                .observe(timer.elapsed().as_secs_f64());
            METRICS
                .ingest_measurements_total
                .with_label_values(&["accepted"])
                .inc_by(result.success_count as u64);
            if result.failure_count > 0 {
                METRICS
                    .ingest_measurements_total
                    .with_label_values(&["rejected"])
                    .inc_by(result.failure_count as u64);
                *error_count += result.failure_count;
            }
            // Informational ack; ok to drop when the egress side is busy.
            let _ = outbound.try_send(Ok(StreamReply {
                payload: Some(stream_data_response::Payload::IngestAck(IngestAck {
                    batch_id,
                    accepted_count: result.success_count as i32,
                    rejected_count: result.failure_count as i32,
                })),
            }));
        }
        Err(err) => {
            METRICS
                .ingest_measurements_total
                .with_label_values(&["failed"])
                .inc_by(submitted as u64);
            *error_count += submitted;
            let _ = registry
                .record_error(device_id, &format!("batch flush failed: {err}"))
                .await;
            warn!(device_id, batch_id = %batch_id, error = %err, "batch flush failed");
        }
    }
}

async fn raise_data_quality_alert(
    repos: &Arc<dyn RepositoryManager>,
    device_id: &str,
    error_count: usize,
) {
    let ctx = OpContext::new();
    let alert = Alert::new(
        Some(device_id.to_string()),
        AlertType::DataQuality,
        AlertSeverity::Warning,
        format!("{error_count} measurements rejected on stream ingest for device {device_id}"),
    );
    if let Err(err) = repos.alert().create(&ctx, &alert).await {
        warn!(device_id, error = %err, "failed to raise data quality alert");
    }
}
