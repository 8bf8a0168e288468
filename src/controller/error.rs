//! # Controller Errors
//!
//! Error type returned by one parent reconciliation pass.

use super::apply::ApplyError;
use super::hooks::HookError;
use crate::dynamic::{SelectorError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// A store call failed
    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },

    /// Three-way merge failed
    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// Decision-function call failed
    #[error("sync hook failed for {parent}: {source}")]
    Hook {
        parent: String,
        #[source]
        source: HookError,
    },

    /// The parent selects children with an invalid selector
    #[error("can't build label selector for {parent}: {source}")]
    Selector {
        parent: String,
        #[source]
        source: SelectorError,
    },

    /// A decision function returned a child the engine refuses to manage
    #[error("invalid desired child {kind} {name}: {reason}")]
    InvalidChild {
        kind: String,
        name: String,
        reason: String,
    },

    /// Configuration could not be turned into a running controller
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Independent failures collected during one pass
    #[error("{}", join_messages(.0))]
    Aggregate(Vec<ControllerError>),
}

fn join_messages(errors: &[ControllerError]) -> String {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("[{}]", messages.join(", "))
}

impl ControllerError {
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }

    /// Collapse collected errors: none is success, one is returned as is
    pub fn aggregate(mut errors: Vec<ControllerError>) -> Result<(), ControllerError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate(errors)),
        }
    }

    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Store { .. } => "store",
            Self::Apply(_) => "apply",
            Self::Hook { .. } => "hook",
            Self::Selector { .. } => "selector",
            Self::InvalidChild { .. } => "invalid_child",
            Self::Config(_) => "config",
            Self::Aggregate(_) => "aggregate",
        }
    }
}
