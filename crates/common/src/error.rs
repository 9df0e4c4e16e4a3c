use thiserror::Error;

/// Common error type for KAIROS with a clear taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// Caller errors
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Acquisition errors
    #[error("Failed to download model: {0}")]
    DownloadFailed(String),

    #[error("Download returned HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// Initialization errors
    #[error("Model loading failed: {0}")]
    ModelLoadFailed(String),

    #[error("Runtime not ready")]
    RuntimeNotReady,

    /// Generation errors
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Cancellation is a distinguished outcome, not a failure
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Persistence errors
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO and serialization errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic anyhow error for flexibility
    #[error("Error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "bad_request",
            Error::ModelNotFound(_) => "model_not_found",
            Error::DownloadFailed(_) | Error::HttpStatus { .. } | Error::Http(_) => "acquisition",
            Error::ModelLoadFailed(_) | Error::RuntimeNotReady => "initialization",
            Error::RuntimeError(_) => "generation",
            Error::Cancelled(_) => "cancelled",
            Error::ConversationNotFound(_) | Error::Storage(_) => "persistence",
            Error::ConfigError(_) => "config",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Anyhow(_) => "unknown",
        }
    }

    /// Whether this error represents a cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Check if the user can reasonably retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DownloadFailed(_) |
            Error::HttpStatus { .. } |
            Error::Http(_) |
            Error::ModelLoadFailed(_) |
            Error::RuntimeNotReady |
            Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
