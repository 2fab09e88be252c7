// Prometheus metrics for webhook delivery and reception
//
// Exposes metrics on the /metrics HTTP endpoint:
// - Delivery attempts by outcome (counter)
// - Delivery attempt latency (histogram)
// - Deliveries created (counter)
// - Inbound events by routing status (counter)

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref DELIVERIES_CREATED_TOTAL: IntCounter = IntCounter::new(
        "webhook_deliveries_created_total",
        "Total number of delivery records created"
    ).expect("Failed to create deliveries created metric");

    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("webhook_delivery_attempts_total", "Delivery attempts by outcome"),
        &["outcome"]
    ).expect("Failed to create delivery attempts metric");

    pub static ref DELIVERY_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "webhook_delivery_duration_seconds",
            "Outbound POST latency",
        ),
    ).expect("Failed to create delivery duration metric");

    pub static ref INBOUND_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("webhook_inbound_events_total", "Inbound events by routing status"),
        &["status"]
    ).expect("Failed to create inbound events metric");
}

/// Register all metrics - must be called once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(DELIVERIES_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DELIVERY_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(INBOUND_EVENTS_TOTAL.clone()))?;
    Ok(())
}

/// Count one delivery attempt outcome (delivered, retrying, failed, inactive)
pub fn record_attempt(outcome: &str) {
    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Count one inbound event by its routing status
pub fn record_inbound(status: &str) {
    INBOUND_EVENTS_TOTAL.with_label_values(&[status]).inc();
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
