//! Prometheus metrics for the gateway.
//!
//! All metrics register against one shared registry so the scrape
//! endpoint (hosted outside this crate) can export everything in one
//! pass. Construction failures are programming errors (duplicate or
//! malformed metric names), so `expect` is appropriate here.

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

/// Shared metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Gateway-wide metric handles.
pub static METRICS: Lazy<GatewayMetrics> = Lazy::new(GatewayMetrics::new);

pub struct GatewayMetrics {
    /// Unary/stream request count by method and terminal status code.
    pub requests_total: IntCounterVec,
    /// Request latency by method and terminal status code.
    pub request_duration_seconds: HistogramVec,
    /// Currently executing caller-facing operations.
    pub active_connections: IntGauge,
    /// Stream messages by method and direction (sent/received).
    pub stream_messages_total: IntCounterVec,
    /// Device registrations by device type and outcome.
    pub device_registrations_total: IntCounterVec,
    /// Devices per status, refreshed by the supervisor.
    pub device_status_total: IntGaugeVec,
    /// Contained panics by method.
    pub panics_total: IntCounterVec,
    /// Ingest batch flush latency.
    pub ingest_flush_duration_seconds: Histogram,
    /// Measurements accepted/rejected through the stream ingest path.
    pub ingest_measurements_total: IntCounterVec,
    /// Commands delivered to devices over stream egress.
    pub commands_delivered_total: IntCounterVec,
    /// Supervisor tick outcomes.
    pub supervisor_ticks_total: IntCounterVec,
}

impl GatewayMetrics {
    fn new() -> Self {
        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total number of gateway requests"),
            &["method", "status_code"],
        )
        .expect("create gateway_requests_total");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Gateway request duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["method", "status_code"],
        )
        .expect("create gateway_request_duration_seconds");

        let active_connections = IntGauge::new(
            "gateway_active_requests",
            "Number of in-flight gateway requests",
        )
        .expect("create gateway_active_requests");

        let stream_messages_total = IntCounterVec::new(
            Opts::new(
                "gateway_stream_messages_total",
                "Total number of stream messages",
            ),
            &["method", "direction"],
        )
        .expect("create gateway_stream_messages_total");

        let device_registrations_total = IntCounterVec::new(
            Opts::new(
                "gateway_device_registrations_total",
                "Total number of device registrations",
            ),
            &["device_type", "outcome"],
        )
        .expect("create gateway_device_registrations_total");

        let device_status_total = IntGaugeVec::new(
            Opts::new("gateway_device_status_total", "Number of devices by status"),
            &["status"],
        )
        .expect("create gateway_device_status_total");

        let panics_total = IntCounterVec::new(
            Opts::new("gateway_panics_total", "Panics contained by the pipeline"),
            &["method"],
        )
        .expect("create gateway_panics_total");

        let ingest_flush_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_ingest_flush_duration_seconds",
                "Measurement batch flush duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .expect("create gateway_ingest_flush_duration_seconds");

        let ingest_measurements_total = IntCounterVec::new(
            Opts::new(
                "gateway_ingest_measurements_total",
                "Measurements ingested through the data stream",
            ),
            &["outcome"],
        )
        .expect("create gateway_ingest_measurements_total");

        let commands_delivered_total = IntCounterVec::new(
            Opts::new(
                "gateway_commands_delivered_total",
                "Commands delivered over stream egress",
            ),
            &["outcome"],
        )
        .expect("create gateway_commands_delivered_total");

        let supervisor_ticks_total = IntCounterVec::new(
            Opts::new(
                "gateway_supervisor_ticks_total",
                "Supervisor tick outcomes",
            ),
            &["outcome"],
        )
        .expect("create gateway_supervisor_ticks_total");

        // Duplicate registration only happens when two GatewayMetrics are
        // constructed in one process (benchmarks); ignore it.
        let _ = REGISTRY.register(Box::new(requests_total.clone()));
        let _ = REGISTRY.register(Box::new(request_duration_seconds.clone()));
        let _ = REGISTRY.register(Box::new(active_connections.clone()));
        let _ = REGISTRY.register(Box::new(stream_messages_total.clone()));
        let _ = REGISTRY.register(Box::new(device_registrations_total.clone()));
        let _ = REGISTRY.register(Box::new(device_status_total.clone()));
        let _ = REGISTRY.register(Box::new(panics_total.clone()));
        let _ = REGISTRY.register(Box::new(ingest_flush_duration_seconds.clone()));
        let _ = REGISTRY.register(Box::new(ingest_measurements_total.clone()));
        let _ = REGISTRY.register(Box::new(commands_delivered_total.clone()));
        let _ = REGISTRY.register(Box::new(supervisor_ticks_total.clone()));

        Self {
            requests_total,
            request_duration_seconds,
            active_connections,
            stream_messages_total,
            device_registrations_total,
            device_status_total,
            panics_total,
            ingest_flush_duration_seconds,
            ingest_measurements_total,
            commands_delivered_total,
            supervisor_ticks_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_construct_once() {
        METRICS
            .requests_total
            .with_label_values(&["RegisterDevice", "OK"])
            .inc();
        METRICS.active_connections.inc();
        METRICS.active_connections.dec();
        assert_eq!(METRICS.active_connections.get(), 0);
    }
}
