//! Error types for the vector engine.

use thiserror::Error;
use vembed_embeddings::EmbeddingError;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the vector engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Embedding or index error.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Request rejected before doing any work.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification for mapping errors onto a caller-facing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is wrong.
    Validation,
    /// No provider can serve the request.
    Unavailable,
    /// Every way of serving the request was tried and failed.
    Exhausted,
    Internal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::Validation,
            Self::Embedding(e) if e.is_validation() => ErrorKind::Validation,
            Self::Embedding(EmbeddingError::ProviderNotConfigured(_)) => ErrorKind::Unavailable,
            Self::Embedding(
                EmbeddingError::AllMethodsFailed { .. } | EmbeddingError::LocalModel(_),
            ) => ErrorKind::Exhausted,
            Self::Embedding(_) | Self::Config(_) | Self::Task(_) | Self::Io(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
