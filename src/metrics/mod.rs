//! Prometheus metrics for the registrar pipeline
//!
//! This module provides metrics tracking for:
//! - Ingest: accepted and rejected heartbeats, buffer size
//! - Scheduler: tick outcomes and durations per job, flushed instances,
//!   announcements and failed announcement events
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for heartbeat ingest metrics
struct IngestMetrics {
    heartbeats: Counter,
    rejected: Counter,
    buffer_size: Gauge,
}

/// Container for background job metrics
struct JobMetrics {
    ticks: CounterVec,
    tick_duration: HistogramVec,
    flushed_instances: Counter,
    announced: Counter,
    event_failures: Counter,
}

static INGEST_METRICS: OnceLock<IngestMetrics> = OnceLock::new();

static JOB_METRICS: OnceLock<JobMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup. Calling it
/// again is a no-op.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = registrar::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let ingest = IngestMetrics {
        heartbeats: register_counter!(
            "registrar_heartbeats_total",
            "Total number of heartbeats accepted into the buffer"
        )?,
        rejected: register_counter!(
            "registrar_heartbeat_rejected_total",
            "Total number of heartbeats rejected by validation"
        )?,
        buffer_size: register_gauge!(
            "registrar_buffer_size",
            "Number of distinct instances waiting for the next flush"
        )?,
    };

    let jobs = JobMetrics {
        ticks: register_counter_vec!(
            "registrar_ticks_total",
            "Total job ticks by job and outcome",
            &["job", "outcome"]
        )?,
        tick_duration: register_histogram_vec!(
            "registrar_tick_duration_seconds",
            "Time spent in one job tick in seconds",
            &["job"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        )?,
        flushed_instances: register_counter!(
            "registrar_flushed_instances_total",
            "Total instance rows written by flush ticks"
        )?,
        announced: register_counter!(
            "registrar_announced_applications_total",
            "Total applications announced with an event"
        )?,
        event_failures: register_counter!(
            "registrar_announcement_event_failures_total",
            "Total applications marked announced whose event write failed"
        )?,
    };

    INGEST_METRICS.set(ingest).map_err(|_| "Ingest metrics already initialized")?;
    JOB_METRICS.set(jobs).map_err(|_| "Job metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    INGEST_METRICS.get().is_some() && JOB_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record an accepted heartbeat and the buffer size after it
pub fn record_heartbeat(buffer_len: usize) {
    let Some(m) = INGEST_METRICS.get() else {
        return;
    };

    m.heartbeats.inc();
    m.buffer_size.set(buffer_len as f64);
}

pub fn record_heartbeat_rejected() {
    if let Some(m) = INGEST_METRICS.get() {
        m.rejected.inc();
    }
}

pub fn set_buffer_size(len: usize) {
    if let Some(m) = INGEST_METRICS.get() {
        m.buffer_size.set(len as f64);
    }
}

/// Record a tick outcome (`completed`, `skipped` or `failed`)
pub fn record_tick(job: &str, outcome: &str) {
    if let Some(m) = JOB_METRICS.get() {
        m.ticks.with_label_values(&[job, outcome]).inc();
    }
}

pub fn record_flushed_instances(count: usize) {
    if let Some(m) = JOB_METRICS.get() {
        m.flushed_instances.inc_by(count as f64);
    }
}

pub fn record_announced() {
    if let Some(m) = JOB_METRICS.get() {
        m.announced.inc();
    }
}

pub fn record_announcement_event_failure() {
    if let Some(m) = JOB_METRICS.get() {
        m.event_failures.inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a tick timer for `job`
pub fn start_tick_timer(job: &str) -> MetricsTimer {
    match JOB_METRICS.get() {
        Some(m) => MetricsTimer::new(m.tick_duration.with_label_values(&[job]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_heartbeat(1);
        record_tick("flush", "completed");

        let text = encode_metrics().unwrap();
        assert!(text.contains("registrar_heartbeats_total"));
        assert!(text.contains("registrar_ticks_total"));
    }

    #[test]
    fn test_job_recording() {
        ensure_metrics_initialized();
        record_flushed_instances(3);
        record_announced();
        record_announcement_event_failure();
        set_buffer_size(0);
        let _timer = start_tick_timer("announce");
    }

    #[test]
    fn test_metrics_noop_without_init() {
        // Must not panic whether or not another test initialized first
        record_heartbeat(1);
        record_heartbeat_rejected();
        record_tick("flush", "skipped");
        let _timer = start_tick_timer("flush");
    }
}
