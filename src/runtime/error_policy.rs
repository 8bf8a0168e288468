//! # Error Policy
//!
//! Error handling and backoff logic for the controller watch loops.
//! This module handles reconciliation errors and watch stream errors.

use crate::constants;
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::ControllerError;
use crate::dynamic::display_name;
use crate::observability;
use crate::runtime::parent_controller::ParentContext;
use kube::api::DynamicObject;
use kube_runtime::controller::Action;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Handle reconciliation errors with Fibonacci backoff
///
/// Backoff state is tracked per parent, so one failing parent does not delay
/// the others. A successful pass resets it, see
/// [`crate::runtime::parent_controller::reconcile`].
pub fn handle_reconciliation_error(
    obj: Arc<DynamicObject>,
    error: &ControllerError,
    ctx: Arc<ParentContext>,
) -> Action {
    let key = display_name(&obj);
    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        parent = %key,
        controller = %ctx.name,
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {}: {}", key, error);

    let backoff_seconds = match ctx.backoff_states.lock() {
        Ok(mut states) => states
            .entry(key.clone())
            .or_insert_with(|| FibonacciBackoff::new(ctx.backoff_min_secs, ctx.backoff_max_secs))
            .next_backoff_seconds(),
        Err(e) => {
            warn!("Failed to lock backoff_states: {}, using minimum backoff", e);
            ctx.backoff_min_secs
        }
    };

    info!(
        parent = %key,
        backoff_secs = backoff_seconds,
        "retrying with Fibonacci backoff"
    );
    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(Duration::from_secs(backoff_seconds))
}

/// Handle watch stream errors with appropriate classification and backoff
///
/// Returns `None` to drop the error and let the watch restart, or `Some(())`
/// to keep going.
pub async fn handle_watch_stream_error(
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
) -> Option<()> {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        error = %error_string
    );
    let _error_guard = error_span.enter();

    let is_401 = error_string.contains("401") || error_string.contains("Unauthorized");
    let is_410 = error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired");
    let is_429 = error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests");
    let is_not_found = error_string.contains("ObjectNotFound")
        || (error_string.contains("404") && error_string.contains("not found"));

    if is_401 {
        error!("Watch authentication failed (401 Unauthorized), RBAC may have been revoked or the token expired");
        error!("Check that the ServiceAccount of {} can list compositecontrollers and controllerrevisions", constants::CONTROLLER_NAME);
        warn!(
            "Waiting {}s before retrying watch",
            constants::DEFAULT_WATCH_RESTART_DELAY_SECS
        );
        tokio::time::sleep(Duration::from_secs(constants::DEFAULT_WATCH_RESTART_DELAY_SECS)).await;
        None
    } else if is_410 {
        warn!(error_type = "410", "watch resource version expired, watch will restart");
        None
    } else if is_429 {
        let current_backoff = backoff.load(Ordering::Relaxed);
        warn!(
            "API server storage reinitializing (429), backing off for {}ms before restart",
            current_backoff
        );
        tokio::time::sleep(Duration::from_millis(current_backoff)).await;
        let new_backoff = current_backoff.saturating_mul(2).min(max_backoff_ms);
        backoff.store(new_backoff, Ordering::Relaxed);
        None
    } else if is_not_found {
        warn!("Resource not found (likely deleted), continuing watch");
        Some(())
    } else {
        error!("Controller stream error: {}", error_string);
        tokio::time::sleep(Duration::from_secs(constants::DEFAULT_WATCH_RESTART_DELAY_SECS)).await;
        None
    }
}
