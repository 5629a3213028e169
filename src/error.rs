//! Error surface shared by the core and the HTTP adapter.
//!
//! Five transport-agnostic kinds; services translate lower-layer failures
//! into these and the API layer maps them onto canonical status codes.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing library, document, or chunk.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad input: dimension mismatch, zero vector, invalid index config,
    /// non-positive k, empty query vector.
    #[error("validation: {0}")]
    Validation(String),

    /// Optimistic concurrency failure; the caller should re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Lock acquisition timed out.
    #[error("busy: {0}")]
    Busy(String),

    /// Invariant violation. Never retried.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn validation(msg: impl std::fmt::Display) -> Self {
        Error::Validation(msg.to_string())
    }

    pub fn conflict(msg: impl std::fmt::Display) -> Self {
        Error::Conflict(msg.to_string())
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Error::Internal(msg.to_string())
    }

    /// Short machine-readable code used by the wire format and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Validation(_) => "validation",
            Error::Conflict(_) => "conflict",
            Error::Busy(_) => "busy",
            Error::Internal(_) => "internal",
        }
    }
}
