use thiserror::Error;

/// Errors surfaced by the prediction stores and the request layer above them
#[derive(Error, Debug)]
pub enum StorageError {
    /// No session exists for the requested uid
    #[error("prediction not found: {uid}")]
    NotFound { uid: String },

    /// Caller input rejected before reaching a backend
    #[error("validation error: {0}")]
    Validation(String),

    /// A persistence call was rejected or could not complete
    #[error("{operation} failed: {message}")]
    Write {
        operation: &'static str,
        message: String,
    },

    /// A read against the backend could not complete
    #[error("{operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    /// Persisted data could not be mapped back into the model
    #[error("malformed stored record: {0}")]
    Decode(String),

    /// Missing or invalid configuration at construction time
    #[error("config error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn not_found(uid: impl Into<String>) -> Self {
        Self::NotFound { uid: uid.into() }
    }

    pub fn write(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Write {
            operation,
            message: err.to_string(),
        }
    }

    pub fn backend(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Backend {
            operation,
            message: err.to_string(),
        }
    }

    /// Whether the error is a definitive rejection of the caller's request
    /// rather than a server-side failure
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
