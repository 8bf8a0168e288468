//! # Runtime Module
//!
//! Process wiring for the Composite Controller: initialization, the HTTP
//! server, the supervisor of per-CompositeController tasks, the watch loops
//! and error handling.

pub mod error_policy;
pub mod initialization;
pub mod parent_controller;
pub mod server;
pub mod supervisor;
pub mod watch_loop;

pub use error_policy::*;
pub use initialization::*;
pub use parent_controller::*;
pub use server::*;
pub use supervisor::*;
pub use watch_loop::*;
