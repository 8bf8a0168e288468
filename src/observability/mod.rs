//! # Observability
//!
//! Prometheus metrics for the controller. Logs go through `tracing`, set up in
//! [`crate::runtime::initialization`].

pub mod metrics;
