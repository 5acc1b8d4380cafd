use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::error::{Error, Result};

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> Result<C> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| Error::Internal(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

/// All counters, gauges and histograms the broker emits, registered on a
/// private registry so tests can instantiate them independently.
pub struct Metrics {
    registry: Registry,

    pub connections_active: IntGaugeVec,
    pub connections_total: IntCounterVec,
    pub connections_rejected: IntCounterVec,

    pub channels_active: IntGauge,
    pub channel_subscriptions: IntCounterVec,

    pub messages_published: IntCounterVec,
    pub messages_sent: IntCounterVec,
    pub message_errors: IntCounterVec,
    pub message_latency: HistogramVec,

    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,

    pub apps_loaded: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        Ok(Self {
            connections_active: register(
                &registry,
                IntGaugeVec::new(
                    Opts::new(
                        "wavehub_connections_active",
                        "Number of active WebSocket connections",
                    ),
                    &["app_key"],
                )
                .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            connections_total: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(
                        "wavehub_connections_total",
                        "Total number of WebSocket connections established",
                    ),
                    &["app_key"],
                )
                .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            connections_rejected: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(
                        "wavehub_connections_rejected_total",
                        "Total number of rejected connections",
                    ),
                    &["app_key", "reason"],
                )
                .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            channels_active: register(
                &registry,
                IntGauge::new("wavehub_channels_active", "Number of active channels")
                    .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            channel_subscriptions: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(
                        "wavehub_channel_subscriptions_total",
                        "Total number of channel subscriptions",
                    ),
                    &["app_key", "channel_type"],
                )
                .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            messages_published: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(
                        "wavehub_messages_published_total",
                        "Total number of messages published",
                    ),
                    &["app_key", "event_type"],
                )
                .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            messages_sent: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(
                        "wavehub_messages_sent_total",
                        "Total number of messages sent to clients",
                    ),
                    &["app_key"],
                )
                .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            message_errors: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(
                        "wavehub_message_errors_total",
                        "Total number of message delivery errors",
                    ),
                    &["app_key", "error_type"],
                )
                .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            message_latency: register(
                &registry,
                HistogramVec::new(
                    HistogramOpts::new(
                        "wavehub_message_latency_seconds",
                        "Message processing latency in seconds",
                    )
                    .buckets(vec![
                        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                    ]),
                    &["app_key", "event_type"],
                )
                .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            http_requests_total: register(
                &registry,
                IntCounterVec::new(
                    Opts::new("wavehub_http_requests_total", "Total number of HTTP requests"),
                    &["endpoint", "method", "status"],
                )
                .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            http_request_duration: register(
                &registry,
                HistogramVec::new(
                    HistogramOpts::new(
                        "wavehub_http_request_duration_seconds",
                        "HTTP request latencies in seconds",
                    ),
                    &["endpoint", "method"],
                )
                .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            apps_loaded: register(
                &registry,
                IntGauge::new(
                    "wavehub_apps_loaded",
                    "Number of apps loaded from configuration",
                )
                .map_err(|e| Error::Internal(e.to_string()))?,
            )?,
            registry,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {e}")))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}
