//! Composite Controller Library
//!
//! A generic Kubernetes controller: a `CompositeController` object names one
//! parent resource type, the child resource types it owns and a decision
//! function (webhook) that maps a parent plus its observed children to the
//! desired children and the parent status. The engine claims children,
//! converges them with a three-way apply, and stages child updates across
//! `ControllerRevision`s when a rolling update strategy is configured.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod dynamic;
pub mod observability;
pub mod runtime;

pub use crd::*;
