//! Crate error types
//!
//! Errors that abort the construction of a component. Errors happening while
//! events flow are [`StreamError`](crate::io::StreamError)s and are absorbed
//! by the component that detects them.

use crate::io::StreamError;

/// Result alias for fallible constructors and configuration
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for component construction and configuration
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Filesystem access failed (cache directory, queue file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A filter string could not be parsed
    #[error("invalid filter '{0}'")]
    InvalidFilter(String),

    /// An endpoint references a name that the factory does not know
    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    /// Configuration is inconsistent or could not be parsed
    #[error("configuration error: {0}")]
    Config(String),

    /// A stream-level failure surfaced while constructing a component
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}
