//! Controller error types.

use std::fmt;

use octorun_history::HistoryError;
use octorun_state::StateError;
use thiserror::Error;

/// Errors that can occur while reconciling a runner set.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("revision history error: {0}")]
    History(#[from] HistoryError),

    #[error("invalid runner set {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("reconciliation of {0} exceeded its deadline")]
    DeadlineExceeded(String),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("reconcile task failed: {0}")]
    Task(String),
}

impl ControllerError {
    /// Whether re-running the reconciliation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::State(e) => e.is_transient(),
            ControllerError::History(e) => e.is_transient(),
            ControllerError::Invalid { .. } => false,
            ControllerError::DeadlineExceeded(_) => true,
            ControllerError::Aggregate(e) => e.is_transient(),
            ControllerError::Task(_) => true,
        }
    }
}

/// Failures collected from a fan-out of independent operations.
#[derive(Debug)]
pub struct AggregateError(pub Vec<ControllerError>);

impl AggregateError {
    pub fn is_transient(&self) -> bool {
        self.0.iter().any(ControllerError::is_transient)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [only] = self.0.as_slice() {
            return write!(f, "{only}");
        }
        write!(f, "{} errors: [", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        f.write_str("]")
    }
}

impl std::error::Error for AggregateError {}

pub type ControllerResult<T> = Result<T, ControllerError>;
