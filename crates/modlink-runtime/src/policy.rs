//! Security policy document.
//!
//! The policy decides where bundles may live, whether they must be signed,
//! which permissions may be requested and which are granted, and the
//! resource limits each mod runs under. Loaded from TOML or JSON:
//!
//! ```toml
//! require_signed_bundles = true
//! public_key_path = "/etc/modlink/bundles.pub"
//! bundle_root = "/opt/game/mods"
//! allowed_permissions = ["events.publish", "events.subscribe", "network"]
//! default_permissions = ["events.publish", "events.subscribe"]
//! trusted_mods = ["com.example.core"]
//!
//! [mod_permissions]
//! "com.example.chat" = ["events.publish", "events.subscribe", "network"]
//!
//! [resource_profiles.default]
//! max_event_publish_rate = 50
//! ```

use crate::error::{RuntimeError, RuntimeResult};
use crate::package::PackageLimits;
use crate::permission::PermissionSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Name of the resource profile used when a mod has no override.
pub const DEFAULT_PROFILE: &str = "default";

/// Resource quota for one mod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,

    /// CPU budget per tick, in milliseconds.
    pub max_cpu_ms_per_tick: f64,

    /// Live host objects the mod may own.
    pub max_objects: u32,

    /// Largest single resource file, in megabytes.
    pub max_file_size_mb: u64,

    /// Events per second.
    pub max_event_publish_rate: u32,

    /// Service calls per second.
    pub max_service_call_rate: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 256,
            max_cpu_ms_per_tick: 5.0,
            max_objects: 1000,
            max_file_size_mb: 10,
            max_event_publish_rate: 100,
            max_service_call_rate: 50,
        }
    }
}

impl ResourceLimits {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Complete security policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub require_signed_bundles: bool,

    /// File holding the hex-encoded ed25519 public key.
    pub public_key_path: Option<PathBuf>,

    /// Hex-encoded public key given inline. Takes precedence over the path.
    pub public_key: Option<String>,

    /// Default directory scanned for bundles. Always an allowed root.
    pub bundle_root: Option<PathBuf>,

    /// Additional roots bundles may be loaded from.
    pub allowed_paths: Vec<PathBuf>,

    /// Permissions a manifest may request at all.
    pub allowed_permissions: PermissionSet,

    /// Permissions granted to mods without an override.
    pub default_permissions: PermissionSet,

    /// Per-mod grant lists.
    pub mod_permissions: HashMap<String, PermissionSet>,

    /// Per-mod resource limits.
    pub mod_limits: HashMap<String, ResourceLimits>,

    /// Named resource profiles; `default` applies when a mod has no override.
    pub resource_profiles: HashMap<String, ResourceLimits>,

    /// Mods granted everything they request.
    pub trusted_mods: Vec<String>,

    /// Extra symbol prefixes rejected by the capability scan.
    pub denied_apis: Vec<String>,

    /// Most entries a package may hold.
    pub max_package_entries: usize,

    /// Largest total uncompressed package size, in megabytes.
    pub max_package_size_mb: u64,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            require_signed_bundles: false,
            public_key_path: None,
            public_key: None,
            bundle_root: None,
            allowed_paths: Vec::new(),
            allowed_permissions: PermissionSet::from_strings([
                "events.publish",
                "events.subscribe",
                "services.call",
                "services.register",
                "objects.create",
                "files.read",
            ]),
            default_permissions: PermissionSet::from_strings([
                "events.publish",
                "events.subscribe",
                "objects.create",
            ]),
            mod_permissions: HashMap::new(),
            mod_limits: HashMap::new(),
            resource_profiles: HashMap::new(),
            trusted_mods: Vec::new(),
            denied_apis: Vec::new(),
            max_package_entries: 4096,
            max_package_size_mb: 256,
        }
    }
}

impl SecurityPolicy {
    pub fn from_toml_str(content: &str) -> RuntimeResult<Self> {
        let policy: Self = toml::from_str(content)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_json_str(content: &str) -> RuntimeResult<Self> {
        let policy: Self = serde_json::from_str(content)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Load a policy file; `.json` is JSON, anything else TOML.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Validate the policy.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.require_signed_bundles && self.public_key.is_none() && self.public_key_path.is_none()
        {
            return Err(RuntimeError::InvalidPolicy(
                "require_signed_bundles is set but no public key is configured".to_string(),
            ));
        }

        let limits = self
            .mod_limits
            .iter()
            .chain(self.resource_profiles.iter());
        for (name, limit) in limits {
            if !limit.max_cpu_ms_per_tick.is_finite() || limit.max_cpu_ms_per_tick < 0.0 {
                return Err(RuntimeError::InvalidPolicy(format!(
                    "Resource limits '{}' have an invalid CPU budget",
                    name
                )));
            }
        }

        if self.max_package_entries == 0 || self.max_package_size_mb == 0 {
            return Err(RuntimeError::InvalidPolicy(
                "package limits must be greater than 0".to_string(),
            ));
        }

        let ungrantable = self.default_permissions.missing_from(&self.allowed_permissions);
        if !ungrantable.is_empty() {
            warn!(
                permissions = ?ungrantable,
                "Default permissions include entries outside allowed_permissions"
            );
        }

        Ok(())
    }

    /// Roots a bundle path must fall under.
    pub fn allowed_roots(&self) -> Vec<&Path> {
        self.bundle_root
            .iter()
            .chain(self.allowed_paths.iter())
            .map(PathBuf::as_path)
            .collect()
    }

    pub fn is_trusted(&self, mod_id: &str) -> bool {
        self.trusted_mods.iter().any(|id| id == mod_id)
    }

    /// Per-mod override, else the `default` profile, else built-in defaults.
    pub fn limits_for(&self, mod_id: &str) -> ResourceLimits {
        self.mod_limits
            .get(mod_id)
            .or_else(|| self.resource_profiles.get(DEFAULT_PROFILE))
            .cloned()
            .unwrap_or_default()
    }

    /// Bounds for extracting packages.
    ///
    /// The manifest has not been read yet at that point, so single entries
    /// are held to the `default` profile's file size limit.
    pub fn package_limits(&self) -> PackageLimits {
        let profile = self
            .resource_profiles
            .get(DEFAULT_PROFILE)
            .cloned()
            .unwrap_or_default();
        PackageLimits {
            max_entries: self.max_package_entries,
            max_entry_bytes: profile.max_file_size_bytes(),
            max_total_bytes: self.max_package_size_mb.saturating_mul(1024 * 1024),
        }
    }
}
