use octorun_state::StateError;
use thiserror::Error;

pub type HistoryResult<T> = Result<T, HistoryError>;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("store error: {0}")]
    Store(#[from] StateError),

    #[error("failed to encode revision data: {0}")]
    Encode(String),

    #[error("failed to decode revision data: {0}")]
    Decode(String),

    #[error("revision name for {set} still collides after {attempts} attempts")]
    CollisionRetriesExhausted { set: String, attempts: u32 },

    #[error("revision {revision} of {set} not found")]
    RevisionNotFound { set: String, revision: i64 },
}

impl HistoryError {
    /// Only store failures are worth retrying; corrupt payloads stay corrupt.
    pub fn is_transient(&self) -> bool {
        match self {
            HistoryError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
