//! Prometheus metrics for stream workers

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Subsequent calls are no-ops.
///
/// If another recorder is already installed the failure is logged and
/// `/metrics` reports that metrics are unavailable.
pub fn init_metrics() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }

    match PROMETHEUS_HANDLE.get_or_try_init(|| PrometheusBuilder::new().install_recorder()) {
        Ok(_) => info!("Prometheus metrics initialized"),
        Err(e) => warn!(error = %e, "Failed to install Prometheus recorder"),
    }
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Per-stream metric helper
#[derive(Clone)]
pub struct StreamMetrics {
    stream_name: String,
    processor_name: String,
}

impl StreamMetrics {
    pub fn new(stream_name: impl Into<String>, processor_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            processor_name: processor_name.into(),
        }
    }

    pub fn job_received(&self, redelivery: bool) {
        counter!(
            "stream_worker_jobs_received_total",
            "stream" => self.stream_name.clone(),
            "processor" => self.processor_name.clone(),
            "redelivery" => redelivery.to_string()
        )
        .increment(1);
    }

    pub fn job_processed(&self, duration: Duration) {
        counter!(
            "stream_worker_jobs_processed_total",
            "stream" => self.stream_name.clone(),
            "processor" => self.processor_name.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "stream_worker_job_duration_seconds",
            "stream" => self.stream_name.clone(),
            "processor" => self.processor_name.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_skipped(&self, reason: &'static str) {
        counter!(
            "stream_worker_jobs_processed_total",
            "stream" => self.stream_name.clone(),
            "processor" => self.processor_name.clone(),
            "status" => "skipped"
        )
        .increment(1);

        counter!(
            "stream_worker_jobs_skipped_total",
            "stream" => self.stream_name.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn job_failed(&self, category: &'static str) {
        counter!(
            "stream_worker_jobs_processed_total",
            "stream" => self.stream_name.clone(),
            "processor" => self.processor_name.clone(),
            "status" => "failed"
        )
        .increment(1);

        counter!(
            "stream_worker_job_errors_total",
            "stream" => self.stream_name.clone(),
            "processor" => self.processor_name.clone(),
            "category" => category
        )
        .increment(1);
    }

    pub fn job_dead_lettered(&self, reason: &'static str) {
        counter!(
            "stream_worker_jobs_dlq_total",
            "stream" => self.stream_name.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn messages_claimed(&self, count: usize) {
        counter!(
            "stream_worker_messages_claimed_total",
            "stream" => self.stream_name.clone()
        )
        .increment(count as u64);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!(
            "stream_worker_in_flight_jobs",
            "stream" => self.stream_name.clone()
        )
        .set(count as f64);
    }

    pub fn stream_depth(&self, depth: i64, pending: i64) {
        gauge!("stream_worker_stream_depth", "stream" => self.stream_name.clone()).set(depth as f64);
        gauge!("stream_worker_pending_count", "stream" => self.stream_name.clone())
            .set(pending as f64);
    }
}
