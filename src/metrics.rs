use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, register_int_counter_vec,
    register_int_gauge, CounterVec, Gauge, HistogramVec, IntCounterVec, IntGauge,
};

lazy_static! {
    // Admission metrics
    pub static ref DECISIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "inferlimit_decisions_total",
        "Total number of admission decisions",
        &["model", "algorithm", "outcome"]
    ).unwrap();

    pub static ref DECISION_DURATION: HistogramVec = register_histogram_vec!(
        "inferlimit_decision_duration_seconds",
        "Admission decision duration in seconds",
        &["path"],
        vec![0.00001, 0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.1]
    ).unwrap();

    pub static ref MODEL_RESOLUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "inferlimit_model_resolutions_total",
        "Model resolutions by source",
        &["source"]
    ).unwrap();

    // Shared store metrics
    pub static ref STORE_DURATION: HistogramVec = register_histogram_vec!(
        "inferlimit_store_duration_seconds",
        "Shared store call duration in seconds",
        &["operation"],
        vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]
    ).unwrap();

    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "inferlimit_store_errors_total",
        "Total number of shared store failures",
        &["operation", "error_type"]
    ).unwrap();

    pub static ref DEGRADED_SIGNALS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "inferlimit_degraded_signals_total",
        "Degraded-mode signals emitted",
        &["model", "reason"]
    ).unwrap();

    pub static ref BREAKER_STATE: IntGauge = register_int_gauge!(
        "inferlimit_circuit_breaker_state",
        "Shared store circuit breaker state (0=closed, 1=open, 2=half-open)"
    ).unwrap();

    // Local cache and sync metrics
    pub static ref CACHE_LOOKUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "inferlimit_cache_lookups_total",
        "Decision cache lookups by result",
        &["result"]
    ).unwrap();

    pub static ref SYNC_TOTAL: IntCounterVec = register_int_counter_vec!(
        "inferlimit_sync_total",
        "Counter synchronizations by result",
        &["result"]
    ).unwrap();

    pub static ref EVICTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "inferlimit_evictions_total",
        "Idle entries evicted",
        &["kind"]
    ).unwrap();

    // Quota metrics
    pub static ref QUOTA_REJECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "inferlimit_quota_rejections_total",
        "Requests rejected by billing-cycle quota",
        &["reason"]
    ).unwrap();

    pub static ref USAGE_TOKENS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "inferlimit_usage_tokens_total",
        "Tokens recorded after completion",
        &["direction"]
    ).unwrap();

    pub static ref USAGE_COST_TOTAL: CounterVec = register_counter_vec!(
        "inferlimit_usage_cost_total",
        "Cost recorded after completion",
        &["source"]
    ).unwrap();

    // Config metrics
    pub static ref CONFIG_RELOADS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "inferlimit_config_reloads_total",
        "Total number of configuration reloads",
        &["result"]
    ).unwrap();

    pub static ref CONFIG_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "inferlimit_config_rejected_total",
        "Model policies rejected at load time",
        &["model"]
    ).unwrap();

    pub static ref ACTIVE_MODELS: Gauge = register_gauge!(
        "inferlimit_active_models",
        "Number of models with an explicit policy"
    ).unwrap();
}

/// Record an admission decision
pub fn record_decision(model: &str, algorithm: &str, allowed: bool, path: &str, duration_secs: f64) {
    let outcome = if allowed { "allowed" } else { "denied" };
    DECISIONS_TOTAL
        .with_label_values(&[model, algorithm, outcome])
        .inc();

    DECISION_DURATION
        .with_label_values(&[path])
        .observe(duration_secs);
}

pub fn record_model_resolution(source: &str) {
    MODEL_RESOLUTIONS_TOTAL.with_label_values(&[source]).inc();
}

/// Record shared store operation duration
pub fn record_store_duration(operation: &str, duration_secs: f64) {
    STORE_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record shared store error
pub fn record_store_error(operation: &str, error_type: &str) {
    STORE_ERRORS_TOTAL
        .with_label_values(&[operation, error_type])
        .inc();
}

pub fn record_degraded(model: &str, reason: &str) {
    DEGRADED_SIGNALS_TOTAL
        .with_label_values(&[model, reason])
        .inc();
}

pub fn set_breaker_state(state: i64) {
    BREAKER_STATE.set(state);
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUPS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_sync(success: bool) {
    let result = if success { "success" } else { "error" };
    SYNC_TOTAL.with_label_values(&[result]).inc();
}

/// A background sync request was dropped because the work queue was full
pub fn record_sync_dropped() {
    SYNC_TOTAL.with_label_values(&["dropped"]).inc();
}

pub fn record_evictions(kind: &str, count: usize) {
    EVICTIONS_TOTAL
        .with_label_values(&[kind])
        .inc_by(count as u64);
}

pub fn record_quota_rejection(reason: &str) {
    QUOTA_REJECTIONS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_usage(tokens_in: u64, tokens_out: u64, cost: f64, source: &str) {
    USAGE_TOKENS_TOTAL.with_label_values(&["in"]).inc_by(tokens_in);
    USAGE_TOKENS_TOTAL.with_label_values(&["out"]).inc_by(tokens_out);
    USAGE_COST_TOTAL.with_label_values(&[source]).inc_by(cost);
}

/// Update config metrics
pub fn update_config_metrics(model_count: usize) {
    ACTIVE_MODELS.set(model_count as f64);
}

/// Record config reload
pub fn record_config_reload(success: bool) {
    let result = if success { "success" } else { "error" };
    CONFIG_RELOADS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_config_rejected(model: &str) {
    CONFIG_REJECTED_TOTAL.with_label_values(&[model]).inc();
}

/// Encode all registered metrics in the Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert metrics to UTF-8: {}", e))
}
