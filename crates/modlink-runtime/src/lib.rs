//! # modlink-runtime
//!
//! Bundle handling for modlink: everything that happens between "a mod is
//! on disk" and "the mod may be instantiated".
//!
//! This crate provides:
//! - Bundle discovery from well-known paths
//! - Manifest parsing (`manifest.toml` or `manifest.json`)
//! - Code module declaration tables
//! - Package (`.mlpkg`) extraction
//! - The security policy and the four-stage validation pipeline
//! - Per-mod security contexts
//!
//! ## Bundle Structure
//!
//! A bundle is a directory (or a zip package with the same layout):
//! - `manifest.toml` - Mod metadata, behaviours and requested permissions
//! - `manifest.sig` - Hex ed25519 signature over the manifest bytes (optional)
//! - `code/*.mlm` - Code module declaration tables
//! - `config/`, `objects/`, `models/`, `textures/`, `audio/` - Resources
//!
//! ## Security Model
//!
//! Bundles request permissions in their manifest. The [`SecurityManager`]
//! rejects bundles that live outside the allowed roots, carry a bad
//! signature, reference denied APIs or request permissions the policy does
//! not allow. Accepted bundles get a [`SecurityContext`] holding the
//! granted subset and their resource limits.

pub mod context;
pub mod discovery;
pub mod error;
pub mod manifest;
pub mod module;
pub mod package;
pub mod permission;
pub mod policy;
pub mod scan;
pub mod security;
pub mod signature;

pub use context::SecurityContext;
pub use discovery::{default_bundle_dir, discover_bundle, discover_bundles, BundleKind, DiscoveredBundle};
pub use error::{RuntimeError, RuntimeResult, ValidationStage};
pub use manifest::{Dependency, ManifestFile, ModManifest, ModMetadata, ResourceLists, ServiceDescriptor, Version};
pub use module::{CodeModule, ModuleFile, ModuleLoader, TypeDecl};
pub use package::{extract_package, is_package, read_package_manifest, ExtractedPackage, PackageLimits};
pub use permission::{Permission, PermissionSet};
pub use policy::{ResourceLimits, SecurityPolicy};
pub use scan::{normalize_symbol, CapabilityScanner, DangerousCapability, ScanFinding};
pub use security::{BundleSource, SecurityManager, ValidatedBundle};
pub use signature::SignatureVerifier;
