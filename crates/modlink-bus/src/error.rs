//! Error types for the event bus.

use crate::event::CorrelationId;
use std::time::Duration;
use thiserror::Error;

/// Error returned by a subscriber callback.
///
/// Handler errors never reach the publisher; the bus logs them and moves on
/// to the next subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Result type for subscriber callbacks.
pub type HandlerResult = Result<(), HandlerError>;

/// Errors raised while reading or writing event fields by name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    /// No descriptor registered for the event kind.
    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    /// The kind has no field with this name.
    #[error("Event kind '{kind}' has no field '{field}'")]
    UnknownField { kind: String, field: String },

    /// The value could not be converted to the field's type.
    #[error("Field '{field}' of '{kind}' expects {expected}, got {actual}")]
    TypeMismatch {
        kind: String,
        field: String,
        expected: &'static str,
        actual: String,
    },

    /// The accessor was applied to an event of another concrete type.
    #[error("Accessor for '{expected}' applied to event of kind '{actual}'")]
    KindMismatch { expected: String, actual: String },

    /// Property path was empty or had an empty segment.
    #[error("Invalid property path: '{0}'")]
    InvalidPath(String),

    /// Metadata fields are read-only.
    #[error("Field '{0}' is read-only")]
    ReadOnly(String),
}

/// Errors from the request/response correlator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No matching response arrived in time, or the stale sweep reclaimed the
    /// entry.
    #[error("Request {correlation_id} timed out after {waited:?}{}", sweep_note(.swept))]
    Timeout {
        correlation_id: CorrelationId,
        waited: Duration,
        swept: bool,
    },

    /// The caller cancelled the wait.
    #[error("Request {0} was cancelled")]
    Cancelled(CorrelationId),

    /// The correlator was disposed while the request was outstanding.
    #[error("Request {0} failed: correlator disposed")]
    Disposed(CorrelationId),

    /// The request event carried no correlation id.
    #[error("Request of kind '{0}' has no correlation id")]
    MissingCorrelationId(String),

    /// Another request with this id is still outstanding.
    #[error("Request {0} is already pending")]
    DuplicateCorrelationId(CorrelationId),

    /// A response with the right id arrived but was not the expected type.
    #[error("Expected response of kind '{expected}', got '{actual}'")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },
}

fn sweep_note(swept: &bool) -> &'static str {
    if *swept {
        " (reclaimed by sweep)"
    } else {
        ""
    }
}

impl RequestError {
    /// True for both per-request timeouts and sweep reclamation.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Timeout { .. })
    }
}
