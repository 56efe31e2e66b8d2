//! Error types for the Quorum core library.

/// Top-level error enum for the Quorum core library.
#[derive(Debug, thiserror::Error)]
pub enum QuorumError {
    #[error("Parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Reasoning service error: {0}")]
    Reasoning(String),

    #[error("Reasoning service timeout: {0}")]
    Timeout(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid task transition for {uuid}: {from} -> {to}")]
    InvalidTransition {
        uuid: String,
        from: String,
        to: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QuorumError {
    /// Whether the shared retry helper should re-attempt after this error.
    ///
    /// Retrieval, reasoning, and timeout failures are transient by contract;
    /// everything else (parse, store, state machine, config) is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QuorumError::Retrieval(_) | QuorumError::Reasoning(_) | QuorumError::Timeout(_)
        )
    }
}

pub type QuorumResult<T> = Result<T, QuorumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(QuorumError::Retrieval("down".into()).is_retryable());
        assert!(QuorumError::Reasoning("503".into()).is_retryable());
        assert!(QuorumError::Timeout("deadline".into()).is_retryable());
        assert!(!QuorumError::Store("locked".into()).is_retryable());
        assert!(!QuorumError::Config("bad".into()).is_retryable());
        assert!(!QuorumError::Parse {
            file: "a.py".into(),
            message: "syntax".into()
        }
        .is_retryable());
    }
}
