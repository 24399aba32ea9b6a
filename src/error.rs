//! Error types for usenet-poster
//!
//! Each variant carries enough context (job id, message id, path) to be
//! actionable without re-deriving it from logs. Domain-specific failures are
//! grouped into nested enums and surfaced through `#[from]` conversions so
//! callers can match narrowly (`QueueError::NotFound`) or broadly (`Error`).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for usenet-poster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-poster
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message
        message: String,
        /// The configuration key that caused the error, if known
        key: Option<String>,
    },

    /// Durable queue error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Connection pool error
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Per-article or per-file posting error
    #[error("posting error: {0}")]
    Post(#[from] PostError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// NNTP protocol or connection error
    #[error("NNTP error: {0}")]
    Nntp(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Article/body encoding error (yEnc, CRC32, random generation)
    #[error("encoding error: {0}")]
    Encoding(String),

    /// External tool execution failed (par2)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Serialization error (job body, NZB accumulator)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The manager/pool/queue has been closed and cannot be used
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Durable queue failure taxonomy (§4.4, §7)
#[derive(Debug, Error)]
pub enum QueueError {
    /// Serialization conflict on a concurrent write; caller may retry
    #[error("transient queue conflict: {0}")]
    Transient(String),

    /// Referenced message/job/check id does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate id on insert
    #[error("conflict: {0}")]
    Conflict(String),

    /// Max retries reached — terminal
    #[error("retries exhausted for {0}")]
    Exhausted(String),

    /// Message body could not be parsed as a `FileJob`
    #[error("corrupt job body for message {0}")]
    Corrupt(String),
}

/// Connection pool failure taxonomy (§4.2)
#[derive(Debug, Error)]
pub enum PoolError {
    /// `GetUploadPool`/`GetVerifyPool` called after `Close`
    #[error("pool manager is closed")]
    Closed,

    /// Provider configuration rejected at construction time
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),

    /// No provider advertises the requested role
    #[error("no providers configured for role {0}")]
    NoProvidersForRole(String),
}

/// Posting/verification failure taxonomy (§4.5, §7)
#[derive(Debug, Error)]
pub enum PostError {
    /// Source file could not be opened or read
    #[error("failed to open {path}: {reason}")]
    FileOpen {
        /// The source file path
        path: PathBuf,
        /// The underlying I/O failure
        reason: String,
    },

    /// Article encoding failed (yEnc, CRC32, random generation exhausted)
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// The upload pool returned a terminal error for an article
    #[error("upload failed for {message_id}: {reason}")]
    Upload {
        /// The article's message-id
        message_id: String,
        /// The provider-level failure
        reason: String,
    },

    /// Verification retries exhausted for a file (`max_reposts` consumed)
    #[error("verification exhausted for {path} after {attempts} attempt(s)")]
    VerifyExhausted {
        /// The source file path
        path: PathBuf,
        /// Number of post+verify attempts made
        attempts: u32,
    },

    /// Job was cancelled externally (not an error condition for retry policy)
    #[error("job cancelled")]
    Cancelled,
}
