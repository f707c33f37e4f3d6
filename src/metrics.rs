// Prometheus metrics for the forwarding agent
//
// Exposes metrics on the /metrics HTTP endpoint:
// - Delivery outcomes and individual attempts (counters)
// - Offline queue depth, enqueues, rejections and drops
// - Credential sync results and active credential count

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Delivery metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("deliveries_total", "Delivery calls by final outcome"),
        &["outcome"]
    ).expect("Failed to create deliveries metric");

    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("delivery_attempts_total", "Outbound HTTP attempts by classification"),
        &["class"]
    ).expect("Failed to create delivery attempts metric");

    // Queue metrics
    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "queue_depth",
        "Number of messages waiting in the offline queue"
    ).expect("Failed to create queue depth metric");

    pub static ref QUEUE_ENQUEUED_TOTAL: IntCounter = IntCounter::new(
        "queue_enqueued_total",
        "Total number of messages buffered for later delivery"
    ).expect("Failed to create queue enqueued metric");

    pub static ref QUEUE_REJECTED_TOTAL: IntCounter = IntCounter::new(
        "queue_rejected_total",
        "Total number of messages rejected because the queue was full"
    ).expect("Failed to create queue rejected metric");

    pub static ref QUEUE_DROPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("queue_dropped_total", "Queued messages dropped permanently"),
        &["reason"]
    ).expect("Failed to create queue dropped metric");

    // Credential metrics
    pub static ref CREDENTIAL_SYNCS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("credential_syncs_total", "Credential sync runs by result"),
        &["status"]
    ).expect("Failed to create credential sync metric");

    pub static ref CREDENTIALS_ACTIVE: IntGauge = IntGauge::new(
        "credentials_active",
        "Number of credentials in the active snapshot"
    ).expect("Failed to create active credentials metric");
}

/// Initialize metrics registry - must be called once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(DELIVERIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(QUEUE_ENQUEUED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_REJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CREDENTIAL_SYNCS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CREDENTIALS_ACTIVE.clone()))?;
    Ok(())
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
