//! Typed error taxonomy shared by every layer of the chronology engine.
//!
//! No panics on the read/write path — every fallible operation returns
//! `Result<T, ChronoqError>` so callers can distinguish benign end-of-stream
//! from genuine corruption.

use thiserror::Error;

/// Result type alias used throughout the chronoq crate family.
pub type Result<T> = std::result::Result<T, ChronoqError>;

#[derive(Error, Debug)]
pub enum ChronoqError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("invariant error: {0}")]
    Invariant(String),
}

impl ChronoqError {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Is this the benign "read past the end of a well-formed log" case?
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
