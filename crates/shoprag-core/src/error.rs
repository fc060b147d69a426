use thiserror::Error;

/// Failure taxonomy of the retrieval engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The embedding provider could not produce a vector.
    #[error("Embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// A document or note was rejected whole; nothing was indexed.
    #[error("Ingestion failed: {reason}")]
    IngestionFailed { reason: String },

    /// An internal invariant was violated (e.g. a cross-machine chunk survived filtering).
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    /// An index read or write failed. Queries degrade the affected side.
    #[error("Index error: {0}")]
    Index(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    pub fn ingestion(reason: impl Into<String>) -> Self {
        Self::IngestionFailed { reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
