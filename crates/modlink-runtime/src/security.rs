//! Bundle validation pipeline and security context construction.
//!
//! ```text
//!  bundle path
//!       │
//!       ├── 1. path containment   (no `..`, under an allowed root)
//!       ├── 2. signature          (only if the policy requires it)
//!       ├── 3. capability scan    (declaration tables vs denylist)
//!       └── 4. permissions        (requested ⊆ allowed)
//!       │
//!       └── ValidatedBundle
//! ```
//!
//! Stages run in order and the first failure rejects the bundle. No bundle
//! code runs at any stage.

use crate::context::SecurityContext;
use crate::error::{RuntimeError, RuntimeResult, ValidationStage};
use crate::manifest::{ManifestFile, ModManifest};
use crate::module::{ModuleFile, ModuleLoader};
use crate::permission::PermissionSet;
use crate::policy::SecurityPolicy;
use crate::scan::CapabilityScanner;
use crate::signature::SignatureVerifier;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Where a bundle came from and where its files are.
///
/// For a bundle directory both are the same path. For a package, `origin`
/// is the archive (checked for containment) and `root` the extraction
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSource {
    pub origin: PathBuf,
    pub root: PathBuf,
}

impl BundleSource {
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            origin: path.clone(),
            root: path,
        }
    }

    pub fn extracted(package: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            origin: package.into(),
            root: root.into(),
        }
    }
}

/// A bundle that passed every validation stage.
#[derive(Debug, Clone)]
pub struct ValidatedBundle {
    /// Canonical path of the bundle origin.
    pub origin: PathBuf,
    pub root: PathBuf,
    pub manifest: ModManifest,
    pub manifest_file: ManifestFile,
    pub modules: Vec<ModuleFile>,
}

/// Runs the validation pipeline under one security policy.
#[derive(Debug)]
pub struct SecurityManager {
    policy: SecurityPolicy,
    verifier: Option<SignatureVerifier>,
    scanner: CapabilityScanner,
}

impl SecurityManager {
    pub fn new(policy: SecurityPolicy) -> RuntimeResult<Self> {
        policy.validate()?;

        let verifier = match (&policy.public_key, &policy.public_key_path) {
            (Some(hex_key), _) => Some(SignatureVerifier::from_hex(hex_key)?),
            (None, Some(path)) => Some(SignatureVerifier::from_file(path)?),
            (None, None) => None,
        };

        let scanner = CapabilityScanner::default().deny_prefixes(policy.denied_apis.clone());

        info!(
            require_signed = policy.require_signed_bundles,
            roots = policy.allowed_roots().len(),
            trusted = policy.trusted_mods.len(),
            "Security manager initialized"
        );

        Ok(Self {
            policy,
            verifier,
            scanner,
        })
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn scanner(&self) -> &CapabilityScanner {
        &self.scanner
    }

    /// Run every stage against a bundle.
    pub fn validate_bundle(&self, source: &BundleSource) -> RuntimeResult<ValidatedBundle> {
        let origin = self.check_path(&source.origin)?;

        let manifest_file = ManifestFile::locate(&source.root)?;
        self.check_signature(&source.root, &manifest_file.raw)?;
        let manifest = manifest_file.parse()?;

        let modules = ModuleLoader::load_dir(&source.root)?;
        self.scan_modules(&modules)?;

        self.check_permissions(&manifest)?;

        info!(
            mod_id = %manifest.id,
            version = %manifest.version,
            modules = modules.len(),
            "Bundle passed validation"
        );

        Ok(ValidatedBundle {
            origin,
            root: source.root.clone(),
            manifest,
            manifest_file,
            modules,
        })
    }

    /// Stage 1: the path has no `..` segments and resolves under an allowed root.
    pub fn check_path(&self, path: &Path) -> RuntimeResult<PathBuf> {
        let stage = ValidationStage::PathContainment;

        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(RuntimeError::validation(
                stage,
                format!("{} contains parent-directory segments", path.display()),
            ));
        }

        if !path.exists() {
            return Err(RuntimeError::BundleNotFound(path.to_path_buf()));
        }

        let resolved = path.canonicalize()?;

        let roots = self.policy.allowed_roots();
        if roots.is_empty() {
            return Err(RuntimeError::validation(stage, "no allowed bundle roots configured"));
        }

        for root in roots {
            match root.canonicalize() {
                Ok(root) if resolved.starts_with(&root) => {
                    debug!(path = %resolved.display(), root = %root.display(), "Bundle path contained");
                    return Ok(resolved);
                }
                Ok(_) => {}
                Err(e) => debug!(root = %root.display(), error = %e, "Allowed root not resolvable"),
            }
        }

        Err(RuntimeError::validation(
            stage,
            format!("{} is outside every allowed root", resolved.display()),
        ))
    }

    /// Stage 2: detached signature over the manifest bytes.
    pub fn check_signature(&self, bundle_root: &Path, manifest_raw: &[u8]) -> RuntimeResult<()> {
        if !self.policy.require_signed_bundles {
            return Ok(());
        }

        let verifier = self.verifier.as_ref().ok_or_else(|| {
            RuntimeError::validation(ValidationStage::Signature, "no public key configured")
        })?;
        verifier.verify_bundle(bundle_root, manifest_raw)
    }

    /// Stage 3: denylist scan of every module's declaration table.
    pub fn scan_modules(&self, modules: &[ModuleFile]) -> RuntimeResult<()> {
        let findings: Vec<_> = modules
            .iter()
            .flat_map(|m| self.scanner.scan(&m.module))
            .collect();

        if findings.is_empty() {
            return Ok(());
        }

        for finding in &findings {
            warn!(
                module = %finding.module,
                type_name = %finding.type_name,
                symbol = %finding.symbol,
                capability = %finding.capability,
                "Denied capability in bundle"
            );
        }

        let summary: Vec<String> = findings.iter().map(ToString::to_string).collect();
        Err(RuntimeError::validation(
            ValidationStage::CapabilityScan,
            summary.join("; "),
        ))
    }

    /// Stage 4: every requested permission is allowed by the policy.
    pub fn check_permissions(&self, manifest: &ModManifest) -> RuntimeResult<()> {
        let missing = manifest
            .permission_set()
            .missing_from(&self.policy.allowed_permissions);

        if missing.is_empty() {
            return Ok(());
        }

        let names: Vec<&str> = missing.iter().map(|p| p.as_str()).collect();
        Err(RuntimeError::validation(
            ValidationStage::Permissions,
            format!("mod '{}' requests disallowed permissions: {}", manifest.id, names.join(", ")),
        ))
    }

    /// Resolve the grant and limits for a validated mod.
    pub fn create_context(&self, manifest: &ModManifest) -> SecurityContext {
        let requested = manifest.permission_set();
        let trusted = self.policy.is_trusted(&manifest.id);

        let granted: PermissionSet = if trusted {
            requested.clone()
        } else if let Some(grant) = self.policy.mod_permissions.get(&manifest.id) {
            requested.intersection(grant)
        } else {
            requested.intersection(&self.policy.default_permissions)
        };

        let withheld = requested.missing_from(&granted);
        if !withheld.is_empty() {
            info!(
                mod_id = %manifest.id,
                withheld = ?withheld,
                "Requested permissions not granted"
            );
        }

        SecurityContext::new(
            manifest.id.clone(),
            granted,
            self.policy.limits_for(&manifest.id),
            trusted,
        )
    }
}
