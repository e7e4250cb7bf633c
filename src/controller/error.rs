//! Error types for the controllers.
//!
//! Defines sentinel, matchable error variants with classification for retry
//! behavior, so callers branch on kinds instead of string matching.

use std::time::Duration;

use thiserror::Error;

use crate::drain::DrainError;
use crate::workload::WorkloadError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error (management cluster)
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Azure management API error
    #[error("Azure API error during {operation}: {message}")]
    Azure { operation: String, message: String },

    /// A dependency of the current transition is not ready yet. Expected and
    /// recoverable: the handler holds its state and the tick is retried.
    #[error("dependency not ready: {0}")]
    NotReady(String),

    /// Workload cluster API unreachable; retry later, never fatal.
    #[error(transparent)]
    Workload(#[from] WorkloadError),

    /// Node drain failure (already classified by the drainer).
    #[error(transparent)]
    Drain(#[from] DrainError),

    /// The state machine was asked to run from a state it does not know.
    /// Bad external input: a corrupted or foreign persisted value, or a
    /// graph changed by a controller up/downgrade.
    #[error("unknown state {state:?} for state machine {machine:?}")]
    UnknownState { machine: String, state: String },

    /// A transition returned a state that is not part of the graph. Internal
    /// inconsistency in the graph definition; fatal for this tick.
    #[error(
        "state machine {machine:?} transition from {from:?} returned unknown state {returned:?}"
    )]
    ExecutionFailed {
        machine: String,
        from: String,
        returned: String,
    },

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Convenience constructor for Azure API failures.
    pub fn azure(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Azure {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Azure { .. } | Error::NotReady(_) => true,
            Error::Workload(e) => e.is_transient(),
            Error::Drain(e) => e.is_transient(),
            Error::UnknownState { .. } | Error::ExecutionFailed { .. } => false,
            Error::MissingField(_) | Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(3600)
        }
    }

}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
