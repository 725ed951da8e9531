//! Bundle discovery.
//!
//! Bundles are discovered from a list of directories, in order. Each entry
//! in a directory is either a bundle directory with a manifest at its root
//! or a `.mlpkg` package. When two bundles share an id, the first one found
//! wins.
//!
//! The default location is `$XDG_DATA_HOME/modlink/mods/` (or the platform
//! equivalent).

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::{ManifestFile, ModManifest};
use crate::package::{is_package, read_package_manifest};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How a bundle is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    Directory,
    Package,
}

/// Information about a discovered bundle.
#[derive(Debug, Clone)]
pub struct DiscoveredBundle {
    /// Bundle directory or package file.
    pub path: PathBuf,

    pub kind: BundleKind,

    pub manifest: ModManifest,
}

impl DiscoveredBundle {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }
}

/// Get the default mods directory.
pub fn default_bundle_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "raibid-labs", "modlink")
        .map(|dirs| dirs.data_dir().join("mods"))
}

/// Discover bundles in each directory, earlier directories first.
pub fn discover_bundles(dirs: &[PathBuf]) -> RuntimeResult<Vec<DiscoveredBundle>> {
    let mut bundles = Vec::new();
    let mut seen_ids = HashSet::new();

    for dir in dirs {
        debug!("Scanning bundle directory: {:?}", dir);
        discover_in_directory(dir, &mut bundles, &mut seen_ids)?;
    }

    info!("Discovered {} bundles", bundles.len());
    Ok(bundles)
}

/// Discover bundles in a specific directory.
pub fn discover_in_directory(
    dir: &Path,
    bundles: &mut Vec<DiscoveredBundle>,
    seen_ids: &mut HashSet<String>,
) -> RuntimeResult<()> {
    if !dir.exists() {
        return Ok(());
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("Failed to read bundle directory {:?}: {}", dir, e);
            return Ok(());
        }
    };

    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        if !path.is_dir() && !is_package(&path) {
            continue;
        }

        match discover_bundle(&path) {
            Ok(bundle) => {
                if seen_ids.contains(bundle.id()) {
                    debug!("Skipping duplicate bundle: {} at {:?}", bundle.id(), path);
                    continue;
                }

                info!(
                    "Discovered bundle: {} v{} at {:?}",
                    bundle.name(),
                    bundle.version(),
                    path
                );
                seen_ids.insert(bundle.id().to_string());
                bundles.push(bundle);
            }
            Err(RuntimeError::ManifestNotFound(_)) => {
                debug!("Skipping {:?}: no manifest", path);
            }
            Err(e) => {
                warn!("Failed to read bundle at {:?}: {}", path, e);
            }
        }
    }

    Ok(())
}

/// Read a single bundle directory or package.
pub fn discover_bundle(path: &Path) -> RuntimeResult<DiscoveredBundle> {
    if is_package(path) {
        return Ok(DiscoveredBundle {
            path: path.to_path_buf(),
            kind: BundleKind::Package,
            manifest: read_package_manifest(path)?,
        });
    }

    if !path.is_dir() {
        return Err(RuntimeError::BundleNotFound(path.to_path_buf()));
    }

    let manifest = ManifestFile::locate(path)?.parse()?;
    Ok(DiscoveredBundle {
        path: path.to_path_buf(),
        kind: BundleKind::Directory,
        manifest,
    })
}
