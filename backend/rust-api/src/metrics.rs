use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Duel lifecycle
    pub static ref DUELS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "duels_total",
        "Duel lifecycle events",
        &["event"]
    )
    .unwrap();

    pub static ref DUEL_ANSWERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "duel_answers_total",
        "Total number of duel answers recorded",
        &["correct"]
    )
    .unwrap();

    // Transactions
    pub static ref TRANSACTION_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "transaction_retries_total",
        "Transactions retried after a serialization conflict",
        &["operation"]
    )
    .unwrap();

    pub static ref TRANSACTION_RETRY_EXHAUSTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "transaction_retry_exhausted_total",
        "Transactions that ran out of conflict retries",
        &["operation"]
    )
    .unwrap();

    // Timeout jobs
    pub static ref DUEL_TIMEOUT_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "duel_timeout_jobs_total",
        "Timeout finisher jobs by outcome",
        &["status"]
    )
    .unwrap();

    pub static ref DUEL_WORKER_TICKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "duel_worker_ticks_total",
        "Total number of duel timeout worker ticks",
        &["status"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

pub fn record_duel_event(event: &str) {
    DUELS_TOTAL.with_label_values(&[event]).inc();
}

pub fn record_answer(correct: bool) {
    DUEL_ANSWERS_TOTAL
        .with_label_values(&[if correct { "true" } else { "false" }])
        .inc();
}

pub fn record_timeout_job(status: &str) {
    DUEL_TIMEOUT_JOBS_TOTAL.with_label_values(&[status]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let _ = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/health", "200"])
            .get();
        let _ = TRANSACTION_RETRIES_TOTAL.with_label_values(&["connect"]).get();
    }

    #[test]
    fn test_render_metrics() {
        record_duel_event("created");
        record_answer(true);

        let output = render_metrics().unwrap();
        assert!(output.contains("duels_total"));
        assert!(output.contains("duel_answers_total"));
    }
}
