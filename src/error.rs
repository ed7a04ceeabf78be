//! Error taxonomy shared across the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type. Domain errors convert into this via `#[from]`.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or empty request input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The per-request budget was exceeded.
    #[error("request timed out")]
    RequestTimeout,

    /// The request was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Relational state store failures.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("state row not found: {0}")]
    NotFound(String),
}

/// Retrieval index failures.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A write carried vectors of a different dimension than the index records.
    #[error("embedding dimension mismatch: index has {expected}, write has {got}")]
    DimMismatch { expected: usize, got: usize },

    /// Persisting records to the store failed; fatal to the current source only.
    #[error("index write failed: {0}")]
    WriteFailed(String),

    #[error("vector store error: {0}")]
    Store(String),
}

/// LLM and embedding deployment failures.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("completion failed: {0}")]
    CompletionFailed(String),

    /// The model returned output that does not conform to the requested schema.
    #[error("model output parsing failed: {0}")]
    ParsingFailed(String),

    /// The model stopped because it ran out of output tokens.
    #[error("completion truncated by token limit")]
    LengthExceeded,
}

/// External provider (Notion / Google Drive) failures.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429; the worker backs off and resumes from its cursor.
    #[error("provider rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Transient failure; retried a bounded number of times.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("unsupported file type: {0}")]
    UnsupportedMime(String),

    /// Text extraction from an exported artifact failed.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
}

/// OAuth credential failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential cannot be refreshed; the caller must reconnect.
    #[error("reconnect required: {0}")]
    ReconnectRequired(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("no credential for {0}")]
    MissingCredential(String),

    #[error("oauth state invalid or expired")]
    InvalidState,
}

impl Error {
    /// Whether this error should abort only the current source during a sync
    /// run, leaving other sources untouched.
    pub fn is_per_source(&self) -> bool {
        matches!(
            self,
            Error::Index(IndexError::WriteFailed(_))
                | Error::Llm(LlmError::EmbeddingFailed(_))
                | Error::Provider(ProviderError::UnsupportedMime(_))
                | Error::Provider(ProviderError::ExtractionFailed(_))
                | Error::Provider(ProviderError::Api { .. })
        )
    }
}
