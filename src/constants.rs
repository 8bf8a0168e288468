//! # Constants
//!
//! Well-known annotation and label keys plus configuration defaults.

/// Annotation holding the last partial object the engine applied to a child
pub const LAST_APPLIED_ANNOTATION: &str = "metacontroller.k8s.io/last-applied-configuration";

/// Label added to ControllerRevisions to scope them to a parent API group
pub const LABEL_KEY_API_GROUP: &str = "metacontroller.k8s.io/apiGroup";

/// Label added to ControllerRevisions to scope them to a parent resource
pub const LABEL_KEY_RESOURCE: &str = "metacontroller.k8s.io/resource";

/// Label used by generated selectors
pub const CONTROLLER_UID_LABEL: &str = "controller-uid";

/// Prefix of the finalizer kept on parents when a finalize hook is configured
pub const FINALIZER_PREFIX: &str = "metacontroller.k8s.io/compositecontroller-";

/// Field manager / component name
pub const CONTROLLER_NAME: &str = "composite-controller";

/// Maximum length of an object name in the store
pub const MAX_NAME_LENGTH: usize = 253;

/// Status condition type written onto parents by the rollout orchestrator
pub const CONDITION_TYPE_UPDATED: &str = "Updated";

/// Condition reasons reported by the rollout orchestrator
pub const REASON_ROLLOUT_WAITING: &str = "RolloutWaiting";
pub const REASON_ROLLOUT_PROGRESSING: &str = "RolloutProgressing";
pub const REASON_ON_LATEST_REVISION: &str = "OnLatestRevision";

/// Default revision-relevant field paths
pub const DEFAULT_REVISION_FIELD_PATHS: &[&str] = &["spec"];

/// Default decision-function timeout in seconds
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 10;

/// Default read-modify-write retry policy
pub const DEFAULT_CONFLICT_RETRY_STEPS: u32 = 5;
pub const DEFAULT_CONFLICT_RETRY_INITIAL_MS: u64 = 10;
pub const DEFAULT_CONFLICT_RETRY_FACTOR: u32 = 5;

/// Default per-parent error backoff bounds (seconds)
pub const DEFAULT_ERROR_BACKOFF_MIN_SECS: u64 = 1;
pub const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 300;

/// Default HTTP server port for metrics and probes
pub const DEFAULT_METRICS_PORT: u16 = 9000;

/// Default server startup timeout in seconds
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default server readiness poll interval in milliseconds
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Delay before restarting a failed CompositeController watch (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;
