//! # Controller
//!
//! The reconciliation engine for one CompositeController.
//!
//! - `apply` - three-way merge used to update children
//! - `claim` - adopt and release children and revisions
//! - `children` - create, update and delete children
//! - `strategy` - update strategy lookup per child kind
//! - `hooks` - decision-function calls
//! - `revision` - ControllerRevision history
//! - `rollout` - staged migration of children between revisions
//! - `parent` - one reconciliation pass for one parent
//! - `backoff` - error requeue backoff

pub mod apply;
pub mod backoff;
pub mod children;
pub mod claim;
pub mod error;
pub mod hooks;
pub mod parent;
pub mod revision;
pub mod rollout;
pub mod strategy;

pub use children::{ChildManager, ChildResources};
pub use error::ControllerError;
pub use hooks::{FnHook, HookError, Hooks, SyncHook, SyncRequest, SyncResponse, TimedHook, WebhookSyncHook};
pub use parent::{ParentController, SyncOutcome};
pub use revision::ParentRevision;
pub use rollout::RolloutStep;
pub use strategy::UpdateStrategyMap;
