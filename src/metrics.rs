//! Gauges published by the controller.
//!
//! The controller only sees the [`MetricsSink`] trait; the binary wires in
//! [`PrometheusMetrics`] and tests use their own recording sinks.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::gauge::Gauge as PromGauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;

/// Point-in-time values exported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gauge {
    /// Active client connections including waiting ones
    Connections,
    /// Connections where nginx is reading the request header
    ReadingConnections,
    /// Connections where nginx is writing the response
    WritingConnections,
    /// Idle keepalive connections
    WaitingConnections,
    /// Total accepted client connections
    Accepts,
    /// Total handled client connections
    Handled,
    /// Total client requests
    Requests,
    /// External frontends the instance is attached to
    FrontendsAttached,
}

impl Gauge {
    pub const ALL: [Gauge; 8] = [
        Gauge::Connections,
        Gauge::ReadingConnections,
        Gauge::WritingConnections,
        Gauge::WaitingConnections,
        Gauge::Accepts,
        Gauge::Handled,
        Gauge::Requests,
        Gauge::FrontendsAttached,
    ];

    /// Metric name without the registry prefix
    pub fn name(&self) -> &'static str {
        match self {
            Gauge::Connections => "nginx_connections",
            Gauge::ReadingConnections => "nginx_reading_connections",
            Gauge::WritingConnections => "nginx_writing_connections",
            Gauge::WaitingConnections => "nginx_waiting_connections",
            Gauge::Accepts => "nginx_accepts",
            Gauge::Handled => "nginx_handled",
            Gauge::Requests => "nginx_requests",
            Gauge::FrontendsAttached => "frontends_attached",
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            Gauge::Connections => "The number of active client connections, including waiting",
            Gauge::ReadingConnections => "The number of connections where nginx is reading the request header",
            Gauge::WritingConnections => "The number of connections where nginx is writing the response",
            Gauge::WaitingConnections => "The number of idle client connections waiting for a request",
            Gauge::Accepts => "The total number of accepted client connections",
            Gauge::Handled => "The total number of handled connections",
            Gauge::Requests => "The total number of client requests",
            Gauge::FrontendsAttached => "The total number of frontends attached",
        }
    }
}

/// Receives gauge updates from the controller
pub trait MetricsSink: Send + Sync {
    fn set_gauge(&self, gauge: Gauge, value: f64);
}

/// Discards every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn set_gauge(&self, _gauge: Gauge, _value: f64) {}
}

/// Prometheus registry holding one gauge per [`Gauge`]
pub struct PrometheusMetrics {
    registry: Registry,
    gauges: Vec<(Gauge, PromGauge<f64, AtomicU64>)>,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self::with_prefix("ingress")
    }

    pub fn with_prefix(prefix: &str) -> Self {
        let mut registry = Registry::with_prefix(prefix);
        let gauges = Gauge::ALL
            .iter()
            .map(|gauge| {
                let metric = PromGauge::<f64, AtomicU64>::default();
                registry.register(gauge.name(), gauge.help(), metric.clone());
                (*gauge, metric)
            })
            .collect();

        Self { registry, gauges }
    }

    /// Current value of a gauge
    pub fn get(&self, gauge: Gauge) -> f64 {
        self.gauges
            .iter()
            .find(|(g, _)| *g == gauge)
            .map(|(_, metric)| metric.get())
            .unwrap_or_default()
    }

    /// Text exposition format for a /metrics endpoint
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn set_gauge(&self, gauge: Gauge, value: f64) {
        if let Some((_, metric)) = self.gauges.iter().find(|(g, _)| *g == gauge) {
            metric.set(value);
        }
    }
}
