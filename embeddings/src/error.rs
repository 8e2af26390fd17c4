//! Error types for the embeddings system.

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// No provider can serve the requested route.
    #[error("embedding provider not configured: {0}")]
    ProviderNotConfigured(String),

    /// Batch exceeds the configured maximum.
    #[error("batch size {size} exceeds limit {max}")]
    BatchTooLarge { size: usize, max: usize },

    /// Parallel inputs disagree in length.
    #[error("number of {what} must match: expected {expected}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// API request failed.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The local model failed to encode.
    #[error("local model error: {0}")]
    LocalModel(String),

    /// Remote provider and local fallback both failed.
    #[error("all embedding methods failed: remote: {remote}; local: {local}")]
    AllMethodsFailed { remote: String, local: String },

    /// Cache backend error. Absorbed by the cache store, never surfaced.
    #[error("cache error: {0}")]
    Cache(String),

    /// Index artifact could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EmbeddingError {
    /// Whether the error rejects the input itself. Such errors happen before
    /// any side effect and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::BatchTooLarge { .. } | Self::LengthMismatch { .. } | Self::DimensionMismatch { .. }
        )
    }

    /// Whether a remote call that failed this way is worth another attempt.
    pub(crate) fn is_retryable(&self) -> bool {
        !matches!(self, Self::ProviderNotConfigured(_)) && !self.is_validation()
    }
}
