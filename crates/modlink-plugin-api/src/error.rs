//! Error types for mod behaviours, contexts and the loader.

use crate::instance::ModState;
use modlink_bus::RequestError;
use modlink_runtime::{RuntimeError, ValidationStage};
use std::path::PathBuf;
use thiserror::Error;

/// Error returned by a behaviour hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BehaviourError {
    message: String,
}

impl BehaviourError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for BehaviourError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for BehaviourError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<ContextError> for BehaviourError {
    fn from(err: ContextError) -> Self {
        Self::new(err.to_string())
    }
}

/// Result type for behaviour hooks.
pub type BehaviourResult = Result<(), BehaviourError>;

/// Errors raised by [`ModContext`](crate::ModContext) operations.
#[derive(Error, Debug)]
pub enum ContextError {
    /// The mod was not granted the permission.
    #[error(transparent)]
    Security(#[from] RuntimeError),

    /// The per-second quota is used up.
    #[error("Mod '{mod_id}' exceeded its {what} rate of {limit}/s")]
    RateLimited {
        mod_id: String,
        what: &'static str,
        limit: u32,
    },

    /// The mod already owns its maximum number of live objects.
    #[error("Mod '{mod_id}' reached its object limit of {max}")]
    ObjectLimit { mod_id: String, max: u32 },

    /// No object definition with this name in the resource table.
    #[error("Unknown object definition: {0}")]
    UnknownObject(String),

    /// The host did not provide an object factory.
    #[error("No object factory is available")]
    NoObjectFactory,

    /// The host object factory failed.
    #[error("Object factory error: {0}")]
    Object(String),

    /// The host did not provide a request correlator.
    #[error("Requests are not available in this host")]
    NoCorrelator,

    /// Request/response exchange failed.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Errors from loading, driving and unloading mods.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// The bundle was rejected or could not be read.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A declared behaviour class is not in any code module.
    #[error("Mod '{mod_id}' declares behaviour '{class}' but no code module defines it")]
    ClassNotDeclared { mod_id: String, class: String },

    /// A declared behaviour class has no registered factory.
    #[error("Mod '{mod_id}': no factory registered for behaviour '{class}'")]
    NoFactory { mod_id: String, class: String },

    /// A required dependency is not loaded or has the wrong major version.
    #[error("Mod '{mod_id}' requires '{dependency}' {version}: {reason}")]
    MissingDependency {
        mod_id: String,
        dependency: String,
        version: String,
        reason: String,
    },

    /// A declared resource file is missing, unsafe or too large.
    #[error("Resource '{}' of mod '{mod_id}': {reason}", .path.display())]
    Resource {
        mod_id: String,
        path: PathBuf,
        reason: String,
    },

    /// A behaviour hook failed during a lifecycle step.
    #[error("Behaviour '{class}' of mod '{mod_id}' failed: {source}")]
    Behaviour {
        mod_id: String,
        class: String,
        #[source]
        source: BehaviourError,
    },

    /// The requested lifecycle step is not valid from the current state.
    #[error("Mod '{mod_id}' cannot go from {from} to {to}")]
    InvalidTransition {
        mod_id: String,
        from: ModState,
        to: ModState,
    },

    /// No loaded mod with this id.
    #[error("Mod not loaded: {0}")]
    NotLoaded(String),

    /// The step needs the mod's behaviours while one of its hooks runs.
    #[error("Mod '{0}' is running a behaviour hook")]
    HooksBusy(String),
}

impl LoaderError {
    /// The failed validation stage, if the bundle was rejected by the
    /// security pipeline.
    pub fn stage(&self) -> Option<ValidationStage> {
        match self {
            LoaderError::Runtime(e) => e.stage(),
            _ => None,
        }
    }
}

/// Result type for loader operations.
pub type LoaderResult<T> = std::result::Result<T, LoaderError>;
