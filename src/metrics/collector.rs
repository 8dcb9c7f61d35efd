//! Metrics Collector

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::error;

/// Collects relay metrics and exports them in Prometheus text format
pub struct Metrics {
    prometheus_registry: Registry,

    connections_total: IntCounter,
    active_connections: IntGauge,
    messages_relayed_total: IntCounter,
    messages_rejected_total: IntCounterVec,
    deliveries_total: IntCounter,
    delivery_failures_total: IntCounterVec,
    liveness_timeouts_total: IntCounter,
    origin_rejections_total: IntCounter,
    mirror_failures_total: IntCounter,
    sockets_closed_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let prometheus_registry = Registry::new();

        let connections_total = IntCounter::new(
            "relay_connections_total",
            "Total number of accepted WebSocket connections",
        )
        .expect("Failed to create connections_total counter");

        let active_connections = IntGauge::new(
            "relay_active_connections",
            "Number of currently registered WebSocket connections",
        )
        .expect("Failed to create active_connections gauge");

        let messages_relayed_total = IntCounter::new(
            "relay_messages_relayed_total",
            "Total payloads accepted and broadcast",
        )
        .expect("Failed to create messages_relayed_total counter");

        let messages_rejected_total = IntCounterVec::new(
            Opts::new("relay_messages_rejected_total", "Total payloads rejected"),
            &["reason"],
        )
        .expect("Failed to create messages_rejected_total counter");

        let deliveries_total = IntCounter::new(
            "relay_deliveries_total",
            "Total frames queued to connections",
        )
        .expect("Failed to create deliveries_total counter");

        let delivery_failures_total = IntCounterVec::new(
            Opts::new(
                "relay_delivery_failures_total",
                "Deliveries that failed and evicted the connection",
            ),
            &["reason"],
        )
        .expect("Failed to create delivery_failures_total counter");

        let liveness_timeouts_total = IntCounter::new(
            "relay_liveness_timeouts_total",
            "Connections terminated for not answering a heartbeat",
        )
        .expect("Failed to create liveness_timeouts_total counter");

        let origin_rejections_total = IntCounter::new(
            "relay_origin_rejections_total",
            "Upgrade requests refused by the origin allow-list",
        )
        .expect("Failed to create origin_rejections_total counter");

        let mirror_failures_total = IntCounter::new(
            "relay_mirror_failures_total",
            "Failed writes of the latest payload mirror file",
        )
        .expect("Failed to create mirror_failures_total counter");

        let sockets_closed_total = IntCounterVec::new(
            Opts::new(
                "relay_sockets_closed_total",
                "WebSocket connections whose socket was closed, by cause",
            ),
            &["reason"],
        )
        .expect("Failed to create sockets_closed_total counter");

        prometheus_registry
            .register(Box::new(connections_total.clone()))
            .expect("Failed to register connections_total");
        prometheus_registry
            .register(Box::new(active_connections.clone()))
            .expect("Failed to register active_connections");
        prometheus_registry
            .register(Box::new(messages_relayed_total.clone()))
            .expect("Failed to register messages_relayed_total");
        prometheus_registry
            .register(Box::new(messages_rejected_total.clone()))
            .expect("Failed to register messages_rejected_total");
        prometheus_registry
            .register(Box::new(deliveries_total.clone()))
            .expect("Failed to register deliveries_total");
        prometheus_registry
            .register(Box::new(delivery_failures_total.clone()))
            .expect("Failed to register delivery_failures_total");
        prometheus_registry
            .register(Box::new(liveness_timeouts_total.clone()))
            .expect("Failed to register liveness_timeouts_total");
        prometheus_registry
            .register(Box::new(origin_rejections_total.clone()))
            .expect("Failed to register origin_rejections_total");
        prometheus_registry
            .register(Box::new(mirror_failures_total.clone()))
            .expect("Failed to register mirror_failures_total");
        prometheus_registry
            .register(Box::new(sockets_closed_total.clone()))
            .expect("Failed to register sockets_closed_total");

        Self {
            prometheus_registry,
            connections_total,
            active_connections,
            messages_relayed_total,
            messages_rejected_total,
            deliveries_total,
            delivery_failures_total,
            liveness_timeouts_total,
            origin_rejections_total,
            mirror_failures_total,
            sockets_closed_total,
        }
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    pub fn message_relayed(&self, recipients: usize) {
        self.messages_relayed_total.inc();
        self.deliveries_total.inc_by(recipients as u64);
    }

    pub fn message_rejected(&self, reason: &str) {
        self.messages_rejected_total.with_label_values(&[reason]).inc();
    }

    pub fn delivery_failed(&self, reason: &str) {
        self.delivery_failures_total.with_label_values(&[reason]).inc();
    }

    pub fn liveness_timeout(&self) {
        self.liveness_timeouts_total.inc();
    }

    pub fn origin_rejected(&self) {
        self.origin_rejections_total.inc();
    }

    pub fn mirror_failed(&self) {
        self.mirror_failures_total.inc();
    }

    pub fn socket_closed(&self, reason: &str) {
        self.sockets_closed_total.with_label_values(&[reason]).inc();
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.prometheus_registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }

    pub fn get_active_connections(&self) -> i64 {
        self.active_connections.get()
    }

    pub fn get_total_connections(&self) -> u64 {
        self.connections_total.get()
    }

    pub fn get_messages_relayed(&self) -> u64 {
        self.messages_relayed_total.get()
    }

    pub fn get_messages_rejected(&self, reason: &str) -> u64 {
        self.messages_rejected_total.with_label_values(&[reason]).get()
    }

    pub fn get_delivery_failures(&self, reason: &str) -> u64 {
        self.delivery_failures_total.with_label_values(&[reason]).get()
    }

    pub fn get_liveness_timeouts(&self) -> u64 {
        self.liveness_timeouts_total.get()
    }

    pub fn get_sockets_closed(&self, reason: &str) -> u64 {
        self.sockets_closed_total.with_label_values(&[reason]).get()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
