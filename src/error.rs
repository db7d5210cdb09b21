//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the relay core; the HTTP layer maps these to statuses.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Event failed syntactic or cryptographic validation.
    #[error("{0}")]
    Validation(String),

    /// Author exceeded the sustained ingestion rate.
    #[error("rate limit exceeded")]
    RateLimit,

    /// Event does not meet the proof-of-work target for its kind.
    #[error("{0}")]
    Pow(String),

    /// Author lacks the permission the operation requires.
    #[error("{0}")]
    Unauthorized(String),

    /// An event with this id is already stored.
    #[error("duplicate event")]
    Duplicate,

    /// The requested row does not exist.
    #[error("not found")]
    NotFound,

    /// Group projection failed for a non-authorization reason.
    #[error("{0}")]
    Projection(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] secp256k1::Error),
}

impl RelayError {
    /// True when a plain insert hit a unique-key conflict.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, RelayError::Duplicate)
    }
}

/// Translate a database-level error, promoting row misses to `NotFound` and
/// unique-key conflicts to `Duplicate`.
pub(crate) fn from_sqlx(err: sqlx::Error) -> RelayError {
    match &err {
        sqlx::Error::RowNotFound => RelayError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => RelayError::Duplicate,
        _ => RelayError::Database(err),
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
