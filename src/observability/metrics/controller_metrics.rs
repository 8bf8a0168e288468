//! # Controller Metrics
//!
//! Metrics for parent reconciliation passes, requeues and running controllers.

use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge};
use std::sync::LazyLock;

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "composite_controller_reconciliations_total",
        "Total number of parent reconciliation passes",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "composite_controller_reconciliation_errors_total",
            "Total number of failed parent reconciliation passes",
        ),
        &["reason"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "composite_controller_reconciliation_duration_seconds",
            "Duration of a parent reconciliation pass in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "composite_controller_requeues_total",
            "Total number of parent requeues",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static ACTIVE_CONTROLLERS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "composite_controller_active_controllers",
        "Number of CompositeControllers currently running",
    )
    .expect("Failed to create ACTIVE_CONTROLLERS metric - this should never happen")
});

/// Register controller metrics with the registry
pub(crate) fn register_controller_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_CONTROLLERS.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors(reason: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_active_controllers(count: usize) {
    ACTIVE_CONTROLLERS.set(i64::try_from(count).unwrap_or(i64::MAX));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_reconciliations() {
        let before = RECONCILIATIONS_TOTAL.get();
        increment_reconciliations();
        assert!(RECONCILIATIONS_TOTAL.get() > before);
    }

    #[test]
    fn test_increment_reconciliation_errors_by_reason() {
        let before = RECONCILIATION_ERRORS_TOTAL.with_label_values(&["hook"]).get();
        increment_reconciliation_errors("hook");
        let after = RECONCILIATION_ERRORS_TOTAL.with_label_values(&["hook"]).get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_increment_requeues_total() {
        let before = REQUEUES_TOTAL.with_label_values(&["resync"]).get();
        increment_requeues_total("resync");
        let after = REQUEUES_TOTAL.with_label_values(&["resync"]).get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_set_active_controllers() {
        set_active_controllers(3);
        assert_eq!(ACTIVE_CONTROLLERS.get(), 3);
    }
}
