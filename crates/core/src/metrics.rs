//! Prometheus metrics for the render engine.
//!
//! This module provides metrics for:
//! - Scheduler (submissions, queue depth, promotions, resource pressure)
//! - Workers (running jobs, outcomes, render durations)
//! - Recovery (retries by error category)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Scheduler
// =============================================================================

/// Jobs accepted into the queue by kind.
pub static JOBS_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("framequeue_jobs_submitted_total", "Total jobs submitted"),
        &["kind"],
    )
    .unwrap()
});

/// Jobs waiting in the priority queue.
pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("framequeue_queue_depth", "Jobs waiting in the queue").unwrap()
});

/// Starvation promotions performed.
pub static PROMOTIONS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "framequeue_promotions_total",
        "Jobs promoted one level after waiting too long",
    )
    .unwrap()
});

/// Host resource pressure: 0 healthy, 1 moderate, 2 high, 3 critical.
pub static RESOURCE_STATUS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "framequeue_resource_status",
        "Host resource pressure level used for admission",
    )
    .unwrap()
});

// =============================================================================
// Workers
// =============================================================================

/// Jobs currently being rendered.
pub static RUNNING_JOBS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("framequeue_running_jobs", "Jobs currently rendering").unwrap()
});

/// Jobs reaching a terminal state.
pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("framequeue_jobs_finished_total", "Total jobs finished"),
        &["kind", "outcome"], // "completed", "failed", "cancelled"
    )
    .unwrap()
});

/// Wall-clock duration of render attempts.
pub static RENDER_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "framequeue_render_duration_seconds",
            "Duration of a single render attempt",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        &["kind", "result"],
    )
    .unwrap()
});

// =============================================================================
// Recovery
// =============================================================================

/// Retries scheduled, by error category.
pub static RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("framequeue_retries_total", "Total retries scheduled"),
        &["category"],
    )
    .unwrap()
});

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(JOBS_SUBMITTED.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(PROMOTIONS.clone()),
        Box::new(RESOURCE_STATUS.clone()),
        Box::new(RUNNING_JOBS.clone()),
        Box::new(JOBS_FINISHED.clone()),
        Box::new(RENDER_DURATION.clone()),
        Box::new(RETRIES.clone()),
    ]
}
