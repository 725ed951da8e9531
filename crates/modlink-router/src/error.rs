//! Error types for the communication router.

use modlink_bus::FieldError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading router configuration or executing actions.
///
/// Construction errors are returned to the caller. Everything raised while
/// routing a live event is a routing skip: logged, counted, and never
/// propagated to the publisher.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Failed to read router configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse router configuration as JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse router configuration as TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Unsupported router configuration format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Invalid router configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown condition operator: '{0}'")]
    UnknownOperator(String),

    #[error("Router requires a tokio runtime")]
    NoRuntime,

    /// No event kind with this name is registered.
    #[error("Unknown event kind: '{0}'")]
    UnknownEventKind(String),

    /// No limiter slot became free within the default action timeout.
    #[error("Action '{target}' of route '{route}' waited {waited:?} for a concurrency slot")]
    LimiterTimeout {
        route: String,
        target: String,
        waited: Duration,
    },

    #[error("Action limiter closed")]
    LimiterClosed,

    #[error(transparent)]
    Field(#[from] FieldError),
}

pub type RouterResult<T> = Result<T, RouterError>;
