//! Error taxonomy shared by every component.
//!
//! Mirrors the seven kinds named in the specification: configuration
//! failures are fatal at startup, connection/timeout errors are retryable,
//! duplicate/serialization errors degrade gracefully where the caller says
//! so, and validation errors map straight to a 4xx at the gateway.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_) | Error::Provider { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(e.to_string()),
            _ => Error::Connection(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(Duration::from_secs(0))
        } else {
            Error::Connection(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
