//! Mod manifest parsing.
//!
//! Each bundle has a `manifest.toml` (or `manifest.json`) file at its root
//! that describes its identity, behaviours, dependencies, permissions and
//! resources. The raw bytes are kept alongside the parsed manifest because
//! the detached signature covers them.

use crate::error::{RuntimeError, RuntimeResult};
use crate::permission::PermissionSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Preferred manifest file name.
pub const MANIFEST_TOML: &str = "manifest.toml";

/// Alternate manifest file name.
pub const MANIFEST_JSON: &str = "manifest.json";

/// Mod manifest structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModManifest {
    /// Unique identifier for the mod.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Version string (`major.minor.patch`).
    pub version: String,

    #[serde(default)]
    pub author: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Behaviour instantiated first when the mod loads.
    pub entry_class: String,

    /// Additional behaviours instantiated after the entry behaviour.
    #[serde(default)]
    pub behaviours: Vec<String>,

    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// Services this mod offers to others.
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,

    /// Requested permissions.
    #[serde(default)]
    pub permissions: Vec<String>,

    #[serde(default)]
    pub resources: ResourceLists,

    #[serde(default)]
    pub metadata: ModMetadata,
}

/// Another mod this mod needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: String,

    /// Minimum version; the major version must match.
    pub version: String,

    #[serde(default)]
    pub optional: bool,
}

/// A service interface offered by the mod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,

    /// Interface name consumers bind against.
    pub interface: String,

    #[serde(default)]
    pub description: Option<String>,
}

/// Resource files declared by the bundle, relative to its root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLists {
    #[serde(default)]
    pub models: Vec<String>,

    /// Object/component definition documents.
    #[serde(default)]
    pub objects: Vec<String>,

    /// Configuration blobs.
    #[serde(default)]
    pub configs: Vec<String>,

    #[serde(default)]
    pub textures: Vec<String>,

    #[serde(default)]
    pub audio: Vec<String>,
}

impl ResourceLists {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
            && self.objects.is_empty()
            && self.configs.is_empty()
            && self.textures.is_empty()
            && self.audio.is_empty()
    }

    /// Every declared path.
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.models
            .iter()
            .chain(&self.objects)
            .chain(&self.configs)
            .chain(&self.textures)
            .chain(&self.audio)
            .map(String::as_str)
    }
}

/// Free-form descriptive metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModMetadata {
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub category: Option<String>,

    #[serde(default)]
    pub homepage: Option<String>,

    /// Any other keys.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Parsed `major.minor.patch` version. Pre-release and build suffixes are
/// accepted and ignored for comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// True if `self` can stand in for a dependency on `required`.
    pub fn satisfies(&self, required: &Version) -> bool {
        self.major == required.major && self >= required
    }
}

impl FromStr for Version {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let core = s
            .trim()
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(RuntimeError::InvalidManifest(format!(
                "Version '{}' is not major.minor.patch",
                s
            )));
        }

        let number = |p: &str| {
            p.parse::<u64>().map_err(|_| {
                RuntimeError::InvalidManifest(format!("Version '{}' has a non-numeric part", s))
            })
        };

        Ok(Version {
            major: number(parts[0])?,
            minor: number(parts[1])?,
            patch: number(parts[2])?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl ModManifest {
    /// Parse a manifest from a TOML string.
    pub fn from_toml_str(content: &str) -> RuntimeResult<Self> {
        let manifest: ModManifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a manifest from a JSON string.
    pub fn from_json_str(content: &str) -> RuntimeResult<Self> {
        let manifest: ModManifest = serde_json::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse raw manifest bytes; `file_name` selects the format.
    pub fn from_bytes(file_name: &str, bytes: &[u8]) -> RuntimeResult<Self> {
        let content = std::str::from_utf8(bytes)
            .map_err(|e| RuntimeError::InvalidManifest(format!("Manifest is not UTF-8: {}", e)))?;
        if file_name.ends_with(".json") {
            Self::from_json_str(content)
        } else {
            Self::from_toml_str(content)
        }
    }

    /// Load a manifest file.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(MANIFEST_TOML);
        Self::from_bytes(name, &bytes)
    }

    /// Validate the manifest.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.id.trim().is_empty() {
            return Err(RuntimeError::InvalidManifest(
                "Mod ID cannot be empty".to_string(),
            ));
        }

        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(RuntimeError::InvalidManifest(format!(
                "Mod ID '{}' may only contain letters, digits, '.', '-' and '_'",
                self.id
            )));
        }

        if self.name.trim().is_empty() {
            return Err(RuntimeError::InvalidManifest(
                "Mod name cannot be empty".to_string(),
            ));
        }

        self.parsed_version()?;

        if self.entry_class.trim().is_empty() {
            return Err(RuntimeError::InvalidManifest(
                "Entry class cannot be empty".to_string(),
            ));
        }

        for dep in &self.dependencies {
            if dep.id.trim().is_empty() {
                return Err(RuntimeError::InvalidManifest(
                    "Dependency ID cannot be empty".to_string(),
                ));
            }
            dep.version.parse::<Version>()?;
        }

        if self.permissions.iter().any(|p| p.trim().is_empty()) {
            return Err(RuntimeError::InvalidManifest(
                "Permission names cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn parsed_version(&self) -> RuntimeResult<Version> {
        self.version.parse()
    }

    /// Entry class followed by additional behaviours, without duplicates.
    pub fn behaviour_classes(&self) -> Vec<&str> {
        let mut classes = vec![self.entry_class.as_str()];
        for class in &self.behaviours {
            if !classes.contains(&class.as_str()) {
                classes.push(class);
            }
        }
        classes
    }

    pub fn permission_set(&self) -> PermissionSet {
        PermissionSet::from_strings(&self.permissions)
    }
}

/// A manifest together with the bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    pub path: PathBuf,
    pub raw: Vec<u8>,
}

impl ManifestFile {
    /// Find and read the manifest at a bundle root.
    pub fn locate(bundle_root: &Path) -> RuntimeResult<Self> {
        for name in [MANIFEST_TOML, MANIFEST_JSON] {
            let path = bundle_root.join(name);
            if path.is_file() {
                let raw = std::fs::read(&path)?;
                return Ok(Self { path, raw });
            }
        }
        Err(RuntimeError::ManifestNotFound(bundle_root.to_path_buf()))
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(MANIFEST_TOML)
    }

    pub fn parse(&self) -> RuntimeResult<ModManifest> {
        ModManifest::from_bytes(self.file_name(), &self.raw)
    }
}
