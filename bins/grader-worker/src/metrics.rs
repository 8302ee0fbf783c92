// Prometheus metrics for the grader worker

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Once;
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref SUBMISSIONS_ACCEPTED: IntCounter = IntCounter::new(
        "grader_submissions_accepted_total",
        "Total number of submissions accepted for grading"
    )
    .expect("metric can be created");

    // Rejected before a job was created (bad base64, oversized body, ...)
    pub static ref SUBMISSIONS_REJECTED: CounterVec = CounterVec::new(
        Opts::new("grader_submissions_rejected_total", "Total submissions rejected at intake"),
        &["reason"]
    )
    .expect("metric can be created");

    pub static ref JOBS_COMPLETED: CounterVec = CounterVec::new(
        Opts::new("grader_jobs_completed_total", "Total grading jobs reaching a terminal status"),
        &["status"]
    )
    .expect("metric can be created");

    pub static ref GRADING_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("grader_grading_duration_ms", "End-to-end grading time in milliseconds")
            .buckets(vec![1000.0, 5000.0, 15000.0, 30000.0, 60000.0, 120000.0, 300000.0]),
        &["status"]
    )
    .expect("metric can be created");

    pub static ref SANDBOX_TIMEOUTS: IntCounter = IntCounter::new(
        "grader_sandbox_timeouts_total",
        "Sandbox runs killed by the wall-clock timeout"
    )
    .expect("metric can be created");

    pub static ref JOBS_IN_FLIGHT: IntGauge = IntGauge::new(
        "grader_jobs_in_flight",
        "Grading jobs currently running"
    )
    .expect("metric can be created");

    pub static ref ACTIVE_STREAMS: IntGauge = IntGauge::new(
        "grader_active_progress_streams",
        "Open progress streams"
    )
    .expect("metric can be created");
}

static INIT: Once = Once::new();

/// Register every collector with the registry; safe to call more than once
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(SUBMISSIONS_ACCEPTED.clone()),
            Box::new(SUBMISSIONS_REJECTED.clone()),
            Box::new(JOBS_COMPLETED.clone()),
            Box::new(GRADING_DURATION.clone()),
            Box::new(SANDBOX_TIMEOUTS.clone()),
            Box::new(JOBS_IN_FLIGHT.clone()),
            Box::new(ACTIVE_STREAMS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                warn!(error = %e, "Failed to register metric");
            }
        }
    });
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub fn record_submission_accepted() {
    SUBMISSIONS_ACCEPTED.inc();
}

pub fn record_submission_rejected(reason: &str) {
    SUBMISSIONS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_job_started() {
    JOBS_IN_FLIGHT.inc();
}

/// Paired with `record_job_started` whether the run finished or was aborted
pub fn record_job_left_flight() {
    JOBS_IN_FLIGHT.dec();
}

pub fn record_job_completed(status: &str, duration_ms: f64) {
    JOBS_COMPLETED.with_label_values(&[status]).inc();
    GRADING_DURATION.with_label_values(&[status]).observe(duration_ms);
}

/// A run cut off at shutdown; no duration is observed
pub fn record_job_aborted() {
    JOBS_COMPLETED.with_label_values(&["error"]).inc();
}

pub fn record_sandbox_timeout() {
    SANDBOX_TIMEOUTS.inc();
}

pub fn stream_opened() {
    ACTIVE_STREAMS.inc();
}

pub fn stream_closed() {
    ACTIVE_STREAMS.dec();
}
