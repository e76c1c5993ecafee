//! Prometheus metrics for the worker's admin API.
//!
//! - HTTP request metrics (latency, counts, in flight)
//! - Task counts by status (collected from the store on scrape)
//! - Core dispatch, coordination and collaborator metrics

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

use abd_core::{TaskFilter, TaskStatus};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "abd_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("abd_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "abd_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Task Metrics
// =============================================================================

/// Tasks in the store by status.
pub static TASKS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("abd_tasks_by_status", "Number of stored tasks in each status"),
        &["status"],
    )
    .unwrap()
});

fn register_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(HTTP_REQUEST_DURATION.clone()),
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()),
        Box::new(TASKS_BY_STATUS.clone()),
    ];

    // Core metrics (dispatch, coordination, maintenance, collaborators)
    for metric in collectors
        .into_iter()
        .chain(abd_core::metrics::all_metrics())
    {
        if let Err(e) = registry.register(metric) {
            warn!("Failed to register metric: {}", e);
        }
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Refresh gauges read from the store. Called before encoding.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    for status in [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::ChildPending,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ] {
        let filter = TaskFilter::new().with_status(status);
        match state.store().find_all(&filter).await {
            Ok(tasks) => TASKS_BY_STATUS
                .with_label_values(&[status.as_str()])
                .set(tasks.len() as i64),
            Err(e) => warn!("Failed to count {} tasks: {}", status, e),
        }
    }
}

/// Collapse ids in a request path so metric labels stay bounded.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            let is_uuid = segment.len() == 36 && segment.chars().filter(|c| *c == '-').count() == 4;
            let is_number = !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit());
            if is_uuid || is_number {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
