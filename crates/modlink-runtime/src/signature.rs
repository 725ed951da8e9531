//! Detached manifest signatures.
//!
//! A signed bundle carries `manifest.sig` next to its manifest: the
//! hex-encoded ed25519 signature over the manifest file's raw bytes. The
//! public key is 32 bytes, hex-encoded, read from the path named by the
//! security policy.

use crate::error::{RuntimeError, RuntimeResult, ValidationStage};
use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use std::path::Path;

/// Detached signature file name, relative to the bundle root.
pub const SIGNATURE_FILE: &str = "manifest.sig";

/// Verifies manifest signatures against one public key.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    key: VerifyingKey,
}

impl SignatureVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Parse a hex-encoded public key.
    pub fn from_hex(hex_key: &str) -> RuntimeResult<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| RuntimeError::InvalidPolicy(format!("Public key is not hex: {}", e)))?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            RuntimeError::InvalidPolicy(format!("Public key must be {} bytes", PUBLIC_KEY_LENGTH))
        })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| RuntimeError::InvalidPolicy(format!("Invalid public key: {}", e)))?;
        Ok(Self { key })
    }

    /// Read a hex-encoded public key file.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::InvalidPolicy(format!(
                "Failed to read public key {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_hex(&content)
    }

    /// Verify a hex-encoded signature over `message`.
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> RuntimeResult<()> {
        let bytes = hex::decode(signature_hex.trim()).map_err(|_| {
            RuntimeError::validation(ValidationStage::Signature, "signature is not valid hex")
        })?;
        let bytes: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|_| {
            RuntimeError::validation(
                ValidationStage::Signature,
                format!("signature must be {} bytes", SIGNATURE_LENGTH),
            )
        })?;

        self.key
            .verify(message, &Signature::from_bytes(&bytes))
            .map_err(|_| {
                RuntimeError::validation(
                    ValidationStage::Signature,
                    "signature does not match manifest",
                )
            })
    }

    /// Verify the bundle's detached signature file over `manifest_raw`.
    pub fn verify_bundle(&self, bundle_root: &Path, manifest_raw: &[u8]) -> RuntimeResult<()> {
        let path = bundle_root.join(SIGNATURE_FILE);
        let signature = std::fs::read_to_string(&path).map_err(|_| {
            RuntimeError::validation(
                ValidationStage::Signature,
                format!("missing signature file {}", SIGNATURE_FILE),
            )
        })?;
        self.verify(manifest_raw, &signature)
    }
}
