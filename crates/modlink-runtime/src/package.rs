//! Bundle packages.
//!
//! A package is a zip archive with the `.mlpkg` extension holding a bundle:
//! the manifest, the `code/` directory, optional `config/`, `objects/` and
//! resource directories, and an optional `manifest.sig`. The bundle may sit
//! at the archive root or inside a single top-level directory.
//!
//! Packages are extracted into a temporary directory before validation
//! continues; the directory is removed when the [`ExtractedPackage`] is
//! dropped or cleaned up.

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::{ModManifest, MANIFEST_JSON, MANIFEST_TOML};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

/// Package file extension.
pub const PACKAGE_EXTENSION: &str = "mlpkg";

/// True if `path` has the package extension.
pub fn is_package(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(PACKAGE_EXTENSION))
}

/// Bounds applied while extracting a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageLimits {
    pub max_entries: usize,
    /// Largest uncompressed size of a single entry.
    pub max_entry_bytes: u64,
    /// Largest uncompressed size of the whole package.
    pub max_total_bytes: u64,
}

impl Default for PackageLimits {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            max_entry_bytes: 10 * 1024 * 1024,
            max_total_bytes: 256 * 1024 * 1024,
        }
    }
}

/// A package unpacked into a temporary directory.
#[derive(Debug)]
pub struct ExtractedPackage {
    package: PathBuf,
    root: PathBuf,
    dir: TempDir,
}

impl ExtractedPackage {
    /// The archive this was extracted from.
    pub fn package(&self) -> &Path {
        &self.package
    }

    /// Bundle root inside the extraction directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The temporary extraction directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Delete the extraction directory now, reporting failures.
    pub fn cleanup(self) -> RuntimeResult<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!(path = %path.display(), "Removed extracted package");
        Ok(())
    }
}

/// Extract a package into a fresh directory under `temp_root` (or the
/// system temp directory).
///
/// Entries whose names would land outside the extraction directory reject
/// the whole package, as does going over any of `limits`. Sizes are checked
/// against the bytes actually written, not only the sizes the archive
/// declares.
pub fn extract_package(
    package: &Path,
    temp_root: Option<&Path>,
    limits: &PackageLimits,
) -> RuntimeResult<ExtractedPackage> {
    let file = File::open(package).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => RuntimeError::BundleNotFound(package.to_path_buf()),
        _ => RuntimeError::Io(e),
    })?;
    let mut archive = ZipArchive::new(file)?;

    if archive.len() > limits.max_entries {
        return Err(RuntimeError::Package(format!(
            "{} entries exceed the limit of {}",
            archive.len(),
            limits.max_entries
        )));
    }

    let mut builder = tempfile::Builder::new();
    builder.prefix("modlink-pkg-");
    let dir = match temp_root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };

    let mut total: u64 = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let relative = entry
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .filter(|p| p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)))
            .ok_or_else(|| {
                RuntimeError::Package(format!(
                    "entry '{}' escapes the extraction directory",
                    name
                ))
            })?;

        let target = dir.path().join(&relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        if entry.size() > limits.max_entry_bytes {
            return Err(RuntimeError::Package(format!(
                "entry '{}' is {} bytes, over the limit of {}",
                name,
                entry.size(),
                limits.max_entry_bytes
            )));
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let budget = limits
            .max_entry_bytes
            .min(limits.max_total_bytes.saturating_sub(total));
        let mut out = File::create(&target)?;
        let written = std::io::copy(&mut entry.by_ref().take(budget.saturating_add(1)), &mut out)?;
        if written > budget {
            return Err(RuntimeError::Package(format!(
                "entry '{}' exceeds the package size limits",
                name
            )));
        }
        total += written;
    }

    let root = locate_bundle_root(dir.path())?;
    debug!(
        package = %package.display(),
        root = %root.display(),
        entries = archive.len(),
        bytes = total,
        "Extracted package"
    );

    Ok(ExtractedPackage {
        package: package.to_path_buf(),
        root,
        dir,
    })
}

/// Read a package's manifest without extracting it.
pub fn read_package_manifest(package: &Path) -> RuntimeResult<ModManifest> {
    let mut archive = ZipArchive::new(File::open(package)?)?;

    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    for wanted in [MANIFEST_TOML, MANIFEST_JSON] {
        let Some(name) = names.iter().find(|n| is_manifest_entry(n, wanted)) else {
            continue;
        };

        let mut bytes = Vec::new();
        match archive.by_name(name) {
            Ok(mut entry) => {
                entry.read_to_end(&mut bytes)?;
            }
            Err(ZipError::FileNotFound) => continue,
            Err(e) => return Err(e.into()),
        }
        return ModManifest::from_bytes(wanted, &bytes);
    }

    Err(RuntimeError::ManifestNotFound(package.to_path_buf()))
}

/// `manifest.toml` at the root or one directory down.
fn is_manifest_entry(name: &str, wanted: &str) -> bool {
    let parts: Vec<&str> = name.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [file] => *file == wanted,
        [_, file] => *file == wanted,
        _ => false,
    }
}

fn locate_bundle_root(dir: &Path) -> RuntimeResult<PathBuf> {
    let has_manifest = |p: &Path| p.join(MANIFEST_TOML).is_file() || p.join(MANIFEST_JSON).is_file();

    if has_manifest(dir) {
        return Ok(dir.to_path_buf());
    }

    let subdirs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();

    match subdirs.as_slice() {
        [single] if has_manifest(single) => Ok(single.clone()),
        _ => {
            warn!(dir = %dir.display(), "Package has no manifest at its root");
            Err(RuntimeError::ManifestNotFound(dir.to_path_buf()))
        }
    }
}
