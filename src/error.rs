use std::error::Error as StdError;
use std::io;

use hyper::StatusCode;
use thiserror::Error;

/// Errors carried along a dispatch chain.
///
/// A layer that fails hands one of these to its continuation; every normal
/// layer after it is skipped until an error layer resolves it or the chain
/// runs out and the final handler answers the request.
#[derive(Debug, Error)]
pub enum Error {
    /// A failure that maps onto a specific HTTP status.
    #[error("{message}")]
    Status {
        status: StatusCode,
        message: String,
    },

    /// A layer panicked while handling the request.
    #[error("handler panicked: {0}")]
    Panic(String),

    /// The exchange was already answered.
    #[error("response already sent")]
    AlreadySent,

    /// Every handle to the exchange was dropped before anything answered it.
    #[error("request dropped before a response was sent")]
    Dropped,

    /// Building an HTTP message failed.
    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Any other failure raised by a handler.
    #[error(transparent)]
    Other(Box<dyn StdError + Send + Sync>),
}

impl Error {
    /// Creates an error that the final handler answers with `status`.
    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Error::Status {
            status,
            message: message.into(),
        }
    }

    /// Wraps an arbitrary error raised by a handler.
    pub fn other(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Error::Other(err.into())
    }

    /// The HTTP status this error asks for, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Error::Panic(message)
    }
}

/// Type alias for Results using the dispatcher's Error type
pub type Result<T> = std::result::Result<T, Error>;
