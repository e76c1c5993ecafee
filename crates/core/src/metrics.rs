//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Dispatch (outcomes per topic)
//! - Coordination (gate waiters, aggregator fan-in)
//! - Maintenance (manual replays, purges)
//! - External collaborators (request counts and durations)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};

// =============================================================================
// Dispatch
// =============================================================================

/// Dispatch outcomes by topic.
pub static DISPATCH_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("abd_dispatch_total", "Total task deliveries by outcome"),
        &["topic", "outcome"], // "rejected", "stale", "handled", "failed"
    )
    .unwrap()
});

// =============================================================================
// Coordination
// =============================================================================

/// Tasks currently waiting for an admission slot.
pub static GATE_WAITING: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "abd_gate_waiting",
            "Tasks waiting for a concurrency slot",
        ),
        &["gate"],
    )
    .unwrap()
});

/// Completion evaluations triggered by an emptied group.
pub static AGGREGATOR_FAN_IN: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "abd_aggregator_fan_in_total",
            "Completion evaluations by child topic and result",
        ),
        &["topic", "result"],
    )
    .unwrap()
});

// =============================================================================
// Maintenance
// =============================================================================

/// Failed tasks manually replayed.
pub static TASKS_REPLAYED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("abd_tasks_replayed_total", "Failed tasks reset and republished"),
        &["topic"],
    )
    .unwrap()
});

/// Tasks removed by cleanup.
pub static TASKS_PURGED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("abd_tasks_purged_total", "Tasks removed by cleanup"),
        &[],
    )
    .unwrap()
});

// =============================================================================
// External collaborators
// =============================================================================

/// External collaborator call duration.
pub static EXTERNAL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "abd_external_duration_seconds",
            "Duration of external collaborator calls",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]),
        &["collaborator", "operation"],
    )
    .unwrap()
});

/// External collaborator calls total.
pub static EXTERNAL_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "abd_external_requests_total",
            "Total external collaborator calls",
        ),
        &["collaborator", "operation", "status"], // status: "success", "error"
    )
    .unwrap()
});

/// Records one external call.
pub fn observe_external(collaborator: &str, operation: &str, seconds: f64, ok: bool) {
    EXTERNAL_DURATION
        .with_label_values(&[collaborator, operation])
        .observe(seconds);
    EXTERNAL_REQUESTS
        .with_label_values(&[collaborator, operation, if ok { "success" } else { "error" }])
        .inc();
}

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(DISPATCH_OUTCOMES.clone()),
        Box::new(GATE_WAITING.clone()),
        Box::new(AGGREGATOR_FAN_IN.clone()),
        Box::new(TASKS_REPLAYED.clone()),
        Box::new(TASKS_PURGED.clone()),
        Box::new(EXTERNAL_DURATION.clone()),
        Box::new(EXTERNAL_REQUESTS.clone()),
    ]
}
