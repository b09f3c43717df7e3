// Prometheus metrics for the sandbox API

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};

lazy_static! {
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sandbox_requests_total",
        "Sandbox requests by operation and outcome",
        &["operation", "outcome"]
    )
    .expect("sandbox_requests_total definition");

    pub static ref SECURITY_VIOLATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sandbox_security_violations_total",
        "Submissions rejected by the policy pre-check",
        &["language"]
    )
    .expect("sandbox_security_violations_total definition");

    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "sandbox_request_duration_seconds",
        "Wall-clock duration of sandbox operations",
        &["operation"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("sandbox_request_duration_seconds definition");
}

/// Touch every metric so all series show up before the first request.
pub fn init() {
    lazy_static::initialize(&REQUESTS_TOTAL);
    lazy_static::initialize(&SECURITY_VIOLATIONS_TOTAL);
    lazy_static::initialize(&REQUEST_DURATION_SECONDS);
}

pub fn record_request(operation: &str, outcome: &str) {
    REQUESTS_TOTAL.with_label_values(&[operation, outcome]).inc();
}

pub fn record_security_violation(language: &str) {
    SECURITY_VIOLATIONS_TOTAL.with_label_values(&[language]).inc();
}

/// Text exposition of the default registry.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        init();
        record_request("run", "ok");
        record_security_violation("python");

        let text = render().unwrap();
        assert!(text.contains("sandbox_requests_total"));
        assert!(text.contains("operation=\"run\""));
        assert!(text.contains("sandbox_security_violations_total"));
    }
}
