//! Error types for the modlink runtime.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Stage of the bundle validation pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationStage {
    PathContainment,
    Signature,
    CapabilityScan,
    Permissions,
}

impl ValidationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStage::PathContainment => "path_containment",
            ValidationStage::Signature => "signature",
            ValidationStage::CapabilityScan => "capability_scan",
            ValidationStage::Permissions => "permissions",
        }
    }
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while reading, validating or unpacking bundles.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Bundle directory or package not found.
    #[error("Bundle not found: {0}")]
    BundleNotFound(PathBuf),

    /// No manifest.toml or manifest.json at the bundle root.
    #[error("No manifest found in bundle {0}")]
    ManifestNotFound(PathBuf),

    /// Failed to parse or validate a manifest.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Failed to read a code module declaration table.
    #[error("Code module error: {0}")]
    ModuleError(String),

    /// A security pipeline stage rejected the bundle.
    #[error("Bundle rejected at {stage}: {reason}")]
    Validation {
        stage: ValidationStage,
        reason: String,
    },

    /// Security policy document is unusable.
    #[error("Invalid security policy: {0}")]
    InvalidPolicy(String),

    /// A mod used a permission it was not granted.
    #[error("Mod '{mod_id}' lacks permission '{permission}'")]
    PermissionDenied { mod_id: String, permission: String },

    /// Package archive is malformed or unsafe.
    #[error("Package error: {0}")]
    Package(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Archive error.
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl RuntimeError {
    pub(crate) fn validation(stage: ValidationStage, reason: impl Into<String>) -> Self {
        RuntimeError::Validation {
            stage,
            reason: reason.into(),
        }
    }

    /// The failed pipeline stage, for validation errors.
    pub fn stage(&self) -> Option<ValidationStage> {
        match self {
            RuntimeError::Validation { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
