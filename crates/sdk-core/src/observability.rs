//! Observability infrastructure for the sync core
//!
//! Provides:
//! - Prometheus metrics (fetch latency, submitted batches, sync mode, readiness)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for fetch latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<SyncMetricsInner> = OnceLock::new();

struct SyncMetricsInner {
    fetch_latency_seconds: HistogramVec,
    fetch_errors: IntCounterVec,
    batches_submitted: IntCounterVec,
    records_submitted: IntCounterVec,
    submit_errors: IntCounterVec,
    sync_mode: IntGauge,
    sdk_ready: IntGauge,
    push_transitions: IntCounterVec,
}

impl SyncMetricsInner {
    fn new() -> Self {
        Self {
            fetch_latency_seconds: register_histogram_vec!(
                "flagsync_fetch_latency_seconds",
                "Time spent fetching flag and segment changes",
                &["resource"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register fetch_latency_seconds"),

            fetch_errors: register_int_counter_vec!(
                "flagsync_fetch_errors_total",
                "Total number of failed flag and segment fetches",
                &["resource"]
            )
            .expect("Failed to register fetch_errors"),

            batches_submitted: register_int_counter_vec!(
                "flagsync_batches_submitted_total",
                "Total number of telemetry batches posted",
                &["kind"]
            )
            .expect("Failed to register batches_submitted"),

            records_submitted: register_int_counter_vec!(
                "flagsync_records_submitted_total",
                "Total number of telemetry records posted",
                &["kind"]
            )
            .expect("Failed to register records_submitted"),

            submit_errors: register_int_counter_vec!(
                "flagsync_submit_errors_total",
                "Total number of failed telemetry posts",
                &["kind"]
            )
            .expect("Failed to register submit_errors"),

            sync_mode: register_int_gauge!(
                "flagsync_sync_mode",
                "Current sync mode (0 stopped, 1 polling, 2 streaming)"
            )
            .expect("Failed to register sync_mode"),

            sdk_ready: register_int_gauge!(
                "flagsync_sdk_ready",
                "Whether the main readiness gate is ready"
            )
            .expect("Failed to register sdk_ready"),

            push_transitions: register_int_counter_vec!(
                "flagsync_push_transitions_total",
                "Push subsystem transitions",
                &["transition"]
            )
            .expect("Failed to register push_transitions"),
        }
    }
}

/// Sync metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct SyncMetrics {
    _private: (),
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SyncMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SyncMetricsInner {
        GLOBAL_METRICS.get_or_init(SyncMetricsInner::new)
    }

    pub fn observe_fetch_latency(&self, resource: &str, duration_secs: f64) {
        self.inner()
            .fetch_latency_seconds
            .with_label_values(&[resource])
            .observe(duration_secs);
    }

    pub fn inc_fetch_errors(&self, resource: &str) {
        self.inner().fetch_errors.with_label_values(&[resource]).inc();
    }

    /// Records one posted batch of `records` items
    pub fn record_batch(&self, kind: &str, records: usize) {
        let inner = self.inner();
        inner.batches_submitted.with_label_values(&[kind]).inc();
        inner
            .records_submitted
            .with_label_values(&[kind])
            .inc_by(records as u64);
    }

    pub fn inc_submit_errors(&self, kind: &str) {
        self.inner().submit_errors.with_label_values(&[kind]).inc();
    }

    pub fn set_sync_mode(&self, mode: i64) {
        self.inner().sync_mode.set(mode);
    }

    pub fn set_sdk_ready(&self, ready: bool) {
        self.inner().sdk_ready.set(i64::from(ready));
    }

    pub fn inc_push_transition(&self, transition: &str) {
        self.inner()
            .push_transitions
            .with_label_values(&[transition])
            .inc();
    }
}

/// Structured logger for sync lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_ready(&self, key: Option<&str>) {
        info!(
            event = "sdk_ready",
            instance = %self.instance,
            key = ?key,
            "SDK ready"
        );
    }

    pub fn log_ready_timed_out(&self, key: Option<&str>) {
        warn!(
            event = "sdk_ready_timed_out",
            instance = %self.instance,
            key = ?key,
            "SDK did not become ready in time"
        );
    }

    pub fn log_sync_mode(&self, mode: &str) {
        info!(
            event = "sync_mode_changed",
            instance = %self.instance,
            mode = %mode,
            "Sync mode changed"
        );
    }

    pub fn log_batch_submitted(&self, kind: &str, records: usize, success: bool) {
        if success {
            info!(
                event = "batch_submitted",
                instance = %self.instance,
                kind = %kind,
                records = records,
                "Telemetry batch posted"
            );
        } else {
            warn!(
                event = "batch_submit_failed",
                instance = %self.instance,
                kind = %kind,
                records = records,
                "Telemetry batch post failed, records dropped"
            );
        }
    }

    pub fn log_streaming_disabled(&self) {
        warn!(
            event = "streaming_disabled",
            instance = %self.instance,
            "Streaming disabled for the rest of the session, polling instead"
        );
    }

    pub fn log_startup(&self, version: &str, streaming: bool) {
        info!(
            event = "sync_started",
            instance = %self.instance,
            sdk_version = %version,
            streaming = streaming,
            "Flag sync started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "sync_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Flag sync shutting down"
        );
    }
}
