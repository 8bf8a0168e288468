//! # Metrics Module
//!
//! Prometheus metrics for monitoring the controller, organized by responsibility.
//!
//! ## Sub-modules
//!
//! - `registry` - Metrics registry setup and registration
//! - `controller_metrics` - Parent reconciliations, requeues, running controllers
//! - `engine_metrics` - Hook calls, child operations, rollout migrations

pub mod controller_metrics;
pub mod engine_metrics;
pub mod registry;

pub use controller_metrics::*;
pub use engine_metrics::*;
pub use registry::*;
