use thiserror::Error;

/// Errors produced by the trainlog ingestion and persistence layers.
#[derive(Debug, Error)]
pub enum TrainlogError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TrainlogError {
    /// Whether this error came from writing an artifact rather than from the caller's input.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            TrainlogError::Persistence(_) | TrainlogError::Io(_) | TrainlogError::Timeout
        )
    }
}

pub type TrainlogResult<T> = Result<T, TrainlogError>;
