//! Error taxonomy for the pipeline.
//!
//! Each stage has its own error type so callers can decide per class
//! whether to skip and continue (ingestion, per-chunk embedding), abort a
//! single query, or fail at startup (configuration).

use thiserror::Error;

/// A single source could not be fetched or parsed. Recoverable: the
/// loader skips the source and continues with the rest of the batch.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("failed to read {location}: {reason}")]
    Read { location: String, reason: String },
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("failed to parse {location}: {reason}")]
    Parse { location: String, reason: String },
    #[error("no text could be extracted from {location}")]
    Empty { location: String },
    #[error("unsupported source {location}: {reason}")]
    Unsupported { location: String, reason: String },
}

impl IngestionError {
    /// The path or URL of the failing source.
    pub fn location(&self) -> &str {
        match self {
            IngestionError::Read { location, .. }
            | IngestionError::Parse { location, .. }
            | IngestionError::Empty { location }
            | IngestionError::Unsupported { location, .. } => location,
            IngestionError::Fetch { url, .. } => url,
        }
    }
}

/// Invalid pipeline parameters. Fatal at startup.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("chunk_size must be > 0")]
    ZeroChunkSize,
    #[error("chunk_overlap ({overlap}) must be smaller than chunk_size ({size})")]
    OverlapTooLarge { size: usize, overlap: usize },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("cannot embed empty text")]
    EmptyInput,
    #[error("text contains no embeddable tokens")]
    NoTokens,
    #[error("embedding provider error: {0}")]
    Provider(String),
    #[error("expected {expected}-dimensional embedding, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("provider returned {actual} embeddings for {expected} inputs")]
    BatchLength { expected: usize, actual: usize },
}

/// Index failures. Fatal for the affected index instance; recover by rebuilding.
#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    #[error("duplicate chunk id: {0}")]
    DuplicateId(String),
    #[error("vector for {chunk_id} has {actual} dimensions, index expects {expected}")]
    DimensionMismatch {
        chunk_id: String,
        expected: usize,
        actual: usize,
    },
    #[error("query vector has {actual} dimensions, index expects {expected}")]
    QueryDimension { expected: usize, actual: usize },
    #[error("vector for {0} has zero magnitude")]
    ZeroVector(String),
    #[error("an index rebuild is already in progress")]
    RebuildInProgress,
    #[error("index is corrupt: {0}")]
    Corrupt(String),
}

/// Language-model call failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LanguageModelError {
    #[error("language model request timed out")]
    Timeout,
    #[error("language model rate limited: {0}")]
    RateLimited(String),
    #[error("network error talking to language model: {0}")]
    Network(String),
    #[error("language model server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("language model rejected request {status}: {body}")]
    Client { status: u16, body: String },
    #[error("invalid language model response: {0}")]
    InvalidResponse(String),
    #[error("language model not configured: {0}")]
    NotConfigured(String),
}

impl LanguageModelError {
    /// Whether a later attempt of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LanguageModelError::Timeout
                | LanguageModelError::RateLimited(_)
                | LanguageModelError::Network(_)
                | LanguageModelError::Server { .. }
        )
    }
}

/// Query-time retrieval failure. Aborts only the query that raised it.
#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid similarity threshold: {0}")]
    InvalidThreshold(f32),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Index(#[from] IndexError),
}
