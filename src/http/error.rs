//! Classified HTTP errors.
//!
//! Every failure that reaches the wire is an [`HttpError`]: parse failures in
//! the connection's HTTP parser, routing failures in the
//! [`Dispatcher`](crate::router::Dispatcher), and errors returned by route
//! handlers. Codes below 500 are recoverable (the connection keeps serving);
//! 500 and above close the connection once the error response drains.

use std::error::Error as StdError;

use thiserror::Error;

use super::{StatusCode, reason_phrase};

/// An error that carries the HTTP status it should be answered with.
#[derive(Debug, Error)]
pub enum HttpError {
    /// An error with an explicit status code.
    #[error("{status} {message}")]
    Status { status: u16, message: String },

    /// An unclassified failure. Always answered with `500`.
    #[error("internal error: {0}")]
    Internal(Box<dyn StdError + Send + Sync>),
}

impl HttpError {
    /// Creates an error with the given status and message.
    pub fn new(status: impl Into<u16>, message: impl Into<String>) -> Self {
        Self::Status {
            status: status.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::MethodNotAllowed, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotImplemented, message)
    }

    /// Wraps an arbitrary error as an unclassified `500`.
    pub fn internal(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Internal(err.into())
    }

    /// The status code this error is answered with.
    pub fn status(&self) -> u16 {
        match self {
            Self::Status { status, .. } => *status,
            Self::Internal(_) => StatusCode::InternalServerError.as_u16(),
        }
    }

    /// The human-readable message placed in the error body.
    pub fn message(&self) -> String {
        match self {
            Self::Status { message, .. } if !message.is_empty() => message.clone(),
            Self::Status { status, .. } => reason_phrase(*status).unwrap_or("Error").to_owned(),
            Self::Internal(err) => err.to_string(),
        }
    }

    /// Returns `true` if the connection must close after the error response.
    pub fn is_fatal(&self) -> bool {
        self.status() >= 500
    }
}

impl From<std::io::Error> for HttpError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(Box::new(err))
    }
}
