// Prometheus metrics for the like service
//
// Exposed on the /metrics route:
// - Token pool size (gauge)
// - Refresh cycles and issuance failures (counters)
// - Like requests by outcome (counter) and duration (histogram)
// - Dispatch attempts by outcome (counter)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{Arc, Once};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Token metrics
    pub static ref TOKENS_IN_POOL: IntGauge = IntGauge::new(
        "tokens_in_pool",
        "Number of tokens in the current pool"
    ).expect("Failed to create tokens in pool metric");

    pub static ref REFRESH_CYCLES_TOTAL: IntCounter = IntCounter::new(
        "token_refresh_cycles_total",
        "Total number of token refresh cycles started"
    ).expect("Failed to create refresh cycles metric");

    pub static ref ISSUANCE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "token_issuance_failures_total",
        "Total number of credentials that failed to yield a token"
    ).expect("Failed to create issuance failures metric");

    // Request metrics
    pub static ref LIKE_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("like_requests_total", "Total number of like requests by outcome"),
        &["outcome"]
    ).expect("Failed to create like requests metric");

    pub static ref LIKE_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("like_request_duration_seconds", "End-to-end like request duration")
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["outcome"]
    ).expect("Failed to create like request duration metric");

    pub static ref DISPATCH_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dispatch_attempts_total", "Total number of dispatch attempts by outcome"),
        &["outcome"]
    ).expect("Failed to create dispatch attempts metric");
}

static INIT: Once = Once::new();

/// Register all metrics with the registry; later calls are no-ops
pub fn init() -> prometheus::Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = register_all();
    });
    result
}

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(TOKENS_IN_POOL.clone()))?;
    REGISTRY.register(Box::new(REFRESH_CYCLES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ISSUANCE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LIKE_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LIKE_REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_ATTEMPTS_TOTAL.clone()))?;
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
