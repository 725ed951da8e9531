//! Integration tests for the bundle validation pipeline.
//!
//! These tests cover:
//! - Discovery of bundle directories and packages
//! - Signed and tampered bundles
//! - Capability scan rejections
//! - Permission rejections and grants
//! - Package extraction feeding the pipeline

use ed25519_dalek::{Signer, SigningKey};
use modlink_runtime::{
    discover_bundles, extract_package, BundleKind, BundleSource, Permission, SecurityManager,
    SecurityPolicy, ValidationStage,
};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

struct BundleConfig<'a> {
    permissions: &'a [&'a str],
    references: &'a [(&'a str, &'a str)],
}

impl Default for BundleConfig<'_> {
    fn default() -> Self {
        Self {
            permissions: &["events.publish"],
            references: &[],
        }
    }
}

fn manifest_text(id: &str, permissions: &[&str]) -> String {
    let perms: Vec<String> = permissions.iter().map(|p| format!("\"{}\"", p)).collect();
    format!(
        r#"id = "{id}"
name = "Bundle {id}"
version = "1.0.0"
entry_class = "Main"
permissions = [{}]
"#,
        perms.join(", ")
    )
}

fn module_text(references: &[(&str, &str)]) -> String {
    let refs: Vec<serde_json::Value> = references
        .iter()
        .map(|(owner, method)| serde_json::json!({ "owner": owner, "method": method }))
        .collect();
    serde_json::json!({
        "version": 1,
        "name": "main",
        "types": [{
            "name": "Main",
            "base_type": "ModBehaviour",
            "methods": [{ "name": "on_tick", "params": ["f64"] }],
            "references": refs,
        }]
    })
    .to_string()
}

fn create_bundle(root: &Path, id: &str, config: BundleConfig) -> PathBuf {
    let dir = root.join(id);
    std::fs::create_dir_all(dir.join("code")).unwrap();
    std::fs::write(dir.join("manifest.toml"), manifest_text(id, config.permissions)).unwrap();
    std::fs::write(dir.join("code/main.mlm"), module_text(config.references)).unwrap();
    dir
}

fn sign_bundle(dir: &Path, key: &SigningKey) {
    let raw = std::fs::read(dir.join("manifest.toml")).unwrap();
    let signature = key.sign(&raw);
    std::fs::write(dir.join("manifest.sig"), hex::encode(signature.to_bytes())).unwrap();
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

fn policy_for(root: &Path) -> SecurityPolicy {
    SecurityPolicy {
        bundle_root: Some(root.to_path_buf()),
        ..Default::default()
    }
}

fn signed_policy_for(root: &Path) -> SecurityPolicy {
    SecurityPolicy {
        require_signed_bundles: true,
        public_key: Some(hex::encode(signing_key().verifying_key().to_bytes())),
        ..policy_for(root)
    }
}

// ==============================================================================
// Pipeline
// ==============================================================================

#[test]
fn test_unsigned_bundle_accepted_when_not_required() {
    let temp = TempDir::new().unwrap();
    let dir = create_bundle(temp.path(), "plain", BundleConfig::default());

    let sm = SecurityManager::new(policy_for(temp.path())).unwrap();
    let bundle = sm.validate_bundle(&BundleSource::directory(&dir)).unwrap();

    assert_eq!(bundle.manifest.id, "plain");
    assert_eq!(bundle.modules.len(), 1);
    assert!(bundle.modules[0].module.find_type("Main").is_some());
}

#[test]
fn test_signed_bundle_accepted() {
    let temp = TempDir::new().unwrap();
    let dir = create_bundle(temp.path(), "signed", BundleConfig::default());
    sign_bundle(&dir, &signing_key());

    let sm = SecurityManager::new(signed_policy_for(temp.path())).unwrap();
    assert!(sm.validate_bundle(&BundleSource::directory(&dir)).is_ok());
}

#[test]
fn test_tampered_manifest_rejected() {
    let temp = TempDir::new().unwrap();
    let dir = create_bundle(temp.path(), "tampered", BundleConfig::default());
    sign_bundle(&dir, &signing_key());

    // Grow the permission list after signing.
    std::fs::write(
        dir.join("manifest.toml"),
        manifest_text("tampered", &["events.publish", "files.read"]),
    )
    .unwrap();

    let sm = SecurityManager::new(signed_policy_for(temp.path())).unwrap();
    let err = sm.validate_bundle(&BundleSource::directory(&dir)).unwrap_err();
    assert_eq!(err.stage(), Some(ValidationStage::Signature));
}

#[test]
fn test_missing_signature_rejected() {
    let temp = TempDir::new().unwrap();
    let dir = create_bundle(temp.path(), "unsigned", BundleConfig::default());

    let sm = SecurityManager::new(signed_policy_for(temp.path())).unwrap();
    let err = sm.validate_bundle(&BundleSource::directory(&dir)).unwrap_err();
    assert_eq!(err.stage(), Some(ValidationStage::Signature));
}

#[test]
fn test_wrong_key_rejected() {
    let temp = TempDir::new().unwrap();
    let dir = create_bundle(temp.path(), "other-key", BundleConfig::default());
    sign_bundle(&dir, &SigningKey::from_bytes(&[9u8; 32]));

    let sm = SecurityManager::new(signed_policy_for(temp.path())).unwrap();
    let err = sm.validate_bundle(&BundleSource::directory(&dir)).unwrap_err();
    assert_eq!(err.stage(), Some(ValidationStage::Signature));
}

#[test]
fn test_process_spawn_rejected() {
    let temp = TempDir::new().unwrap();
    let dir = create_bundle(
        temp.path(),
        "spawner",
        BundleConfig {
            references: &[("std::process::Command", "spawn")],
            ..Default::default()
        },
    );

    let sm = SecurityManager::new(policy_for(temp.path())).unwrap();
    let err = sm.validate_bundle(&BundleSource::directory(&dir)).unwrap_err();
    assert_eq!(err.stage(), Some(ValidationStage::CapabilityScan));
    assert!(err.to_string().contains("std::process::Command::spawn"));
}

#[test]
fn test_policy_denied_api_rejected() {
    let temp = TempDir::new().unwrap();
    let dir = create_bundle(
        temp.path(),
        "netty",
        BundleConfig {
            references: &[("std::net::TcpStream", "connect")],
            ..Default::default()
        },
    );

    let sm = SecurityManager::new(policy_for(temp.path())).unwrap();
    assert!(sm.validate_bundle(&BundleSource::directory(&dir)).is_ok());

    let sm = SecurityManager::new(SecurityPolicy {
        denied_apis: vec!["std::net::".to_string()],
        ..policy_for(temp.path())
    })
    .unwrap();
    let err = sm.validate_bundle(&BundleSource::directory(&dir)).unwrap_err();
    assert_eq!(err.stage(), Some(ValidationStage::CapabilityScan));
}

#[test]
fn test_disallowed_permission_rejected() {
    let temp = TempDir::new().unwrap();
    let dir = create_bundle(
        temp.path(),
        "greedy",
        BundleConfig {
            permissions: &["events.publish", "files.write"],
            ..Default::default()
        },
    );

    let sm = SecurityManager::new(policy_for(temp.path())).unwrap();
    let err = sm.validate_bundle(&BundleSource::directory(&dir)).unwrap_err();
    assert_eq!(err.stage(), Some(ValidationStage::Permissions));
}

#[test]
fn test_bundle_outside_root_rejected() {
    let allowed = TempDir::new().unwrap();
    let elsewhere = TempDir::new().unwrap();
    let dir = create_bundle(elsewhere.path(), "stray", BundleConfig::default());

    let sm = SecurityManager::new(policy_for(allowed.path())).unwrap();
    let err = sm.validate_bundle(&BundleSource::directory(&dir)).unwrap_err();
    assert_eq!(err.stage(), Some(ValidationStage::PathContainment));
}

#[cfg(unix)]
#[test]
fn test_symlink_escape_rejected() {
    let allowed = TempDir::new().unwrap();
    let elsewhere = TempDir::new().unwrap();
    let real = create_bundle(elsewhere.path(), "linked", BundleConfig::default());
    let link = allowed.path().join("linked");
    std::os::unix::fs::symlink(&real, &link).unwrap();

    let sm = SecurityManager::new(policy_for(allowed.path())).unwrap();
    let err = sm.validate_bundle(&BundleSource::directory(&link)).unwrap_err();
    assert_eq!(err.stage(), Some(ValidationStage::PathContainment));
}

#[test]
fn test_context_grants_subset() {
    let temp = TempDir::new().unwrap();
    let dir = create_bundle(
        temp.path(),
        "reader",
        BundleConfig {
            permissions: &["events.publish", "files.read"],
            ..Default::default()
        },
    );

    let sm = SecurityManager::new(policy_for(temp.path())).unwrap();
    let bundle = sm.validate_bundle(&BundleSource::directory(&dir)).unwrap();
    let ctx = sm.create_context(&bundle.manifest);

    assert!(ctx.has(&Permission::EventsPublish));
    assert!(!ctx.has(&Permission::FilesRead));
    assert!(ctx.require(&Permission::FilesRead).is_err());
}

// ==============================================================================
// Packages and discovery
// ==============================================================================

fn write_package(path: &Path, id: &str) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    let options = SimpleFileOptions::default();
    zip.start_file("manifest.toml", options).unwrap();
    zip.write_all(manifest_text(id, &["events.publish"]).as_bytes())
        .unwrap();
    zip.start_file("code/main.mlm", options).unwrap();
    zip.write_all(module_text(&[]).as_bytes()).unwrap();
    zip.finish().unwrap();
}

#[test]
fn test_package_validates_after_extraction() {
    let temp = TempDir::new().unwrap();
    let mods = temp.path().join("mods");
    std::fs::create_dir_all(&mods).unwrap();
    let package = mods.join("packed.mlpkg");
    write_package(&package, "packed");

    let sm = SecurityManager::new(policy_for(&mods)).unwrap();
    let limits = sm.policy().package_limits();
    let extracted = extract_package(&package, Some(&temp.path().join("scratch")), &limits).unwrap();
    let bundle = sm
        .validate_bundle(&BundleSource::extracted(&package, extracted.root()))
        .unwrap();

    assert_eq!(bundle.manifest.id, "packed");
    extracted.cleanup().unwrap();
}

#[test]
fn test_discovery_finds_directories_and_packages() {
    let temp = TempDir::new().unwrap();
    create_bundle(temp.path(), "a-dir", BundleConfig::default());
    write_package(&temp.path().join("b-pkg.mlpkg"), "b-pkg");
    // Same id as the directory bundle; the directory sorts first.
    write_package(&temp.path().join("c.mlpkg"), "a-dir");

    let bundles = discover_bundles(&[temp.path().to_path_buf()]).unwrap();
    let ids: Vec<&str> = bundles.iter().map(|b| b.id()).collect();

    assert_eq!(ids, vec!["a-dir", "b-pkg"]);
    assert_eq!(bundles[0].kind, BundleKind::Directory);
    assert_eq!(bundles[1].kind, BundleKind::Package);
}
