//! # Engine Metrics
//!
//! Metrics for decision-function calls and the writes the engine issues.

use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::{HistogramVec, IntCounter, IntCounterVec};
use std::sync::LazyLock;

static HOOK_CALLS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "composite_controller_hook_calls_total",
            "Total number of decision-function calls by hook and outcome",
        ),
        &["hook", "outcome"],
    )
    .expect("Failed to create HOOK_CALLS_TOTAL metric - this should never happen")
});

static HOOK_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "composite_controller_hook_duration_seconds",
            "Duration of decision-function calls in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        &["hook"],
    )
    .expect("Failed to create HOOK_DURATION metric - this should never happen")
});

static CHILD_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "composite_controller_child_operations_total",
            "Total number of child writes by operation",
        ),
        &["operation"],
    )
    .expect("Failed to create CHILD_OPERATIONS_TOTAL metric - this should never happen")
});

static ROLLOUT_MIGRATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "composite_controller_rollout_migrations_total",
        "Total number of children migrated to the latest revision",
    )
    .expect("Failed to create ROLLOUT_MIGRATIONS_TOTAL metric - this should never happen")
});

/// Register engine metrics with the registry
pub(crate) fn register_engine_metrics() -> Result<()> {
    REGISTRY.register(Box::new(HOOK_CALLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HOOK_DURATION.clone()))?;
    REGISTRY.register(Box::new(CHILD_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ROLLOUT_MIGRATIONS_TOTAL.clone()))?;
    Ok(())
}

/// Record one decision-function call; `outcome` is `success`, `error` or `timeout`
pub fn record_hook_call(hook: &str, outcome: &str, duration: f64) {
    HOOK_CALLS_TOTAL.with_label_values(&[hook, outcome]).inc();
    HOOK_DURATION.with_label_values(&[hook]).observe(duration);
}

pub fn increment_child_operations(operation: &str) {
    CHILD_OPERATIONS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn increment_rollout_migrations() {
    ROLLOUT_MIGRATIONS_TOTAL.inc();
}
