//! Error types for the bulk loader.
//!
//! Errors are grouped by how a run reacts to them: configuration errors fail
//! before any write, transport and lifecycle errors are fatal to the run, and
//! per-item write failures are counted rather than raised (see
//! `LoaderError::FailureThresholdExceeded` for the one exception).

use bulk_loader_repository::SearchEngineError;
use thiserror::Error;

use crate::orchestrator::LifecycleState;

/// Invalid or conflicting configuration, detected at transaction start.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required option is missing or empty.
    #[error("Missing required option '{0}'")]
    Missing(&'static str),

    /// An option has an unusable value.
    #[error("Invalid option '{option}': {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },

    /// An option names a column that is not in the schema.
    #[error("Option '{option}' references unknown column '{column}'")]
    UnknownColumn {
        option: &'static str,
        column: String,
    },

    /// Both batch thresholds are unbounded, so a batch could never seal.
    #[error("bulk_actions and bulk_size cannot both be zero")]
    UnboundedBatch,

    /// Two columns project onto overlapping document paths.
    #[error("Document field '{0}' collides with '{1}'")]
    PathCollision(String, String),
}

impl ConfigError {
    pub fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            option,
            reason: reason.into(),
        }
    }

    pub fn unknown_column(option: &'static str, column: impl Into<String>) -> Self {
        Self::UnknownColumn {
            option,
            column: column.into(),
        }
    }
}

/// Errors that end a run.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A destination engine call failed and was not retried.
    #[error("Transport error: {0}")]
    Transport(#[from] SearchEngineError),

    /// A bulk request kept failing after every retry.
    #[error("Bulk batch {sequence} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        sequence: u64,
        attempts: u32,
        #[source]
        source: SearchEngineError,
    },

    /// Too many individual actions were rejected.
    #[error("{failed} bulk actions failed, exceeding the limit of {max}")]
    FailureThresholdExceeded { failed: u64, max: u64 },

    /// Creating, swapping or inspecting an index generation failed.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// The index lifecycle was driven out of order.
    #[error("Invalid lifecycle transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// An input record could not be read or decoded.
    #[error("Input error: {0}")]
    Input(String),

    /// A writer was used after it finished or aborted.
    #[error("Writer error: {0}")]
    Writer(String),

    /// The run was aborted.
    #[error("Run aborted")]
    Aborted,

    /// A background task panicked or was cancelled.
    #[error("Task error: {0}")]
    Join(String),
}

impl LoaderError {
    /// Create a lifecycle error.
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    /// Create an input error.
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    /// Create a writer error.
    pub fn writer(msg: impl Into<String>) -> Self {
        Self::Writer(msg.into())
    }
}

impl From<tokio::task::JoinError> for LoaderError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}
