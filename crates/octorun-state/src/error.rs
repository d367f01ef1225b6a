//! Error types for the octorun state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("conflict on {kind} {key}: submitted resource version {submitted}, stored {stored}")]
    Conflict {
        kind: &'static str,
        key: String,
        submitted: u64,
        stored: u64,
    },

    #[error("{kind} {key} is already controlled by {owner_kind} {owner}")]
    AlreadyOwned {
        kind: &'static str,
        key: String,
        owner_kind: String,
        owner: String,
    },

    #[error("invalid object: {0}")]
    Invalid(String),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StateError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }

    /// Whether retrying the whole operation from a fresh read may succeed.
    ///
    /// Decode failures and invalid objects will fail the same way again.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            StateError::Deserialize(_)
                | StateError::Serialize(_)
                | StateError::Invalid(_)
                | StateError::AlreadyOwned { .. }
        )
    }
}

/// Extension for treating a missing object as success.
pub trait IgnoreNotFound<T> {
    /// Map `NotFound` to `Ok(None)`, keep every other error.
    fn ignore_not_found(self) -> StateResult<Option<T>>;
}

impl<T> IgnoreNotFound<T> for StateResult<T> {
    fn ignore_not_found(self) -> StateResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
