//! Plugin verification with SHA-256 checksums and Ed25519 signatures
//!
//! The [`Verifier`] is a pure trust oracle: it holds a set of named trusted
//! public keys and answers whether a byte blob matches an expected checksum
//! and carries a signature from one of those keys. It performs no I/O.
//!
//! Signatures are base64-encoded raw Ed25519 signatures (64 bytes). Keys are
//! tried in insertion order, so the reported signer is deterministic when
//! several trusted keys would verify the same signature.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier as _, VerifyingKey, KEYPAIR_LENGTH,
    PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use pluginsdk::{MarketplaceManifest, PluginArtifact};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use crate::error::{MarketplaceError, Result};

/// Why a verification did not pass
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationFailure {
    #[error("checksum mismatch: expected {expected}, got {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("artifact has no checksum")]
    MissingChecksum,

    #[error("no signature provided")]
    MissingSignature,

    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(String),

    #[error("invalid signature size: {0}")]
    SignatureSize(usize),

    #[error("signature verification failed: no trusted key matched")]
    UntrustedSignature,

    #[error("signature required but artifact is unsigned")]
    SignatureRequired,

    #[error("manifest has no signature")]
    ManifestUnsigned,

    #[error("serialize manifest: {0}")]
    ManifestEncoding(String),
}

/// How to treat an artifact that arrives without a signature while trusted
/// keys are configured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignaturePolicy {
    /// Log and accept on checksum alone
    #[default]
    Optional,
    /// Reject the artifact
    Required,
}

/// Outcome of a verification, with diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    pub checksum_valid: bool,
    pub signature_valid: bool,
    /// Name of the trusted key that verified the signature
    pub signed_by: Option<String>,
    pub computed_checksum: String,
    pub expected_checksum: String,
    pub failure: Option<VerificationFailure>,
}

impl VerificationResult {
    fn failed(failure: VerificationFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Default::default()
        }
    }

    /// Convert into a `Result`, surfacing the failure reason
    pub fn ensure_valid(self) -> Result<Self, VerificationFailure> {
        if self.valid {
            return Ok(self);
        }
        Err(self
            .failure
            .clone()
            .unwrap_or(VerificationFailure::MissingChecksum))
    }
}

/// Signature and checksum verifier
pub struct Verifier {
    trusted_keys: RwLock<Vec<(String, VerifyingKey)>>,
    policy: SignaturePolicy,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Verifier {
    /// Create a verifier with no trusted keys
    pub fn new() -> Self {
        Self {
            trusted_keys: RwLock::new(Vec::new()),
            policy: SignaturePolicy::default(),
        }
    }

    /// Add a trusted key while building
    pub fn with_trusted_key(self, name: impl Into<String>, key: VerifyingKey) -> Self {
        self.add_trusted_key(name, key);
        self
    }

    /// Add a trusted base64 key while building
    ///
    /// Malformed keys are logged and skipped.
    pub fn with_trusted_key_base64(self, name: impl Into<String>, base64_key: &str) -> Self {
        let name = name.into();
        if let Err(e) = self.add_trusted_key_base64(name.clone(), base64_key) {
            tracing::warn!("Skipping trusted key '{}': {}", name, e);
        }
        self
    }

    /// Set the policy for unsigned artifacts
    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn signature_policy(&self) -> SignaturePolicy {
        self.policy
    }

    /// Verify the SHA-256 checksum of `data` (case-insensitive hex compare)
    pub fn verify_checksum(&self, data: &[u8], expected: &str) -> VerificationResult {
        let computed = compute_checksum(data);
        let mut result = VerificationResult {
            expected_checksum: expected.to_string(),
            ..Default::default()
        };

        if computed.eq_ignore_ascii_case(expected) {
            tracing::debug!("Checksum verified: {}", computed);
            result.checksum_valid = true;
            result.valid = true;
        } else {
            tracing::warn!("Checksum mismatch: expected {}, got {}", expected, computed);
            result.failure = Some(VerificationFailure::ChecksumMismatch {
                expected: expected.to_string(),
                computed: computed.clone(),
            });
        }

        result.computed_checksum = computed;
        result
    }

    /// Verify a base64 Ed25519 signature against every trusted key in turn
    pub fn verify_signature(&self, data: &[u8], signature_base64: &str) -> VerificationResult {
        if signature_base64.is_empty() {
            return VerificationResult::failed(VerificationFailure::MissingSignature);
        }

        let signature = match parse_signature(signature_base64) {
            Ok(sig) => sig,
            Err(failure) => return VerificationResult::failed(failure),
        };

        let keys = self
            .trusted_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        for (name, key) in keys.iter() {
            if key.verify(data, &signature).is_ok() {
                tracing::debug!("Signature verified by '{}'", name);
                return VerificationResult {
                    valid: true,
                    signature_valid: true,
                    signed_by: Some(name.clone()),
                    ..Default::default()
                };
            }
        }

        tracing::warn!("Signature verification failed: no trusted key matched");
        VerificationResult::failed(VerificationFailure::UntrustedSignature)
    }

    /// Verify a downloaded artifact
    ///
    /// The checksum is authoritative and checked first. A signature is
    /// checked when the artifact carries one and trusted keys exist. When
    /// keys exist but the artifact is unsigned, the configured
    /// [`SignaturePolicy`] decides.
    pub fn verify_artifact(&self, data: &[u8], artifact: &PluginArtifact) -> VerificationResult {
        let mut result = VerificationResult::default();

        if !artifact.checksum.is_empty() {
            let checksum = self.verify_checksum(data, &artifact.checksum);
            result.checksum_valid = checksum.checksum_valid;
            result.computed_checksum = checksum.computed_checksum;
            result.expected_checksum = checksum.expected_checksum;
            if !checksum.checksum_valid {
                result.failure = checksum.failure;
                return result;
            }
        } else {
            result.computed_checksum = compute_checksum(data);
        }

        let has_keys = self.has_trusted_keys();
        if !artifact.signature.is_empty() && has_keys {
            let signature = self.verify_signature(data, &artifact.signature);
            result.signature_valid = signature.signature_valid;
            result.signed_by = signature.signed_by;
            if !signature.signature_valid {
                result.failure = signature.failure;
                return result;
            }
        } else if has_keys {
            match self.policy {
                SignaturePolicy::Optional => {
                    tracing::debug!("No signature provided for artifact {}", artifact.url);
                }
                SignaturePolicy::Required => {
                    tracing::warn!("Rejecting unsigned artifact {}", artifact.url);
                    result.failure = Some(VerificationFailure::SignatureRequired);
                    return result;
                }
            }
        }

        if !result.checksum_valid {
            result.failure = Some(VerificationFailure::MissingChecksum);
            return result;
        }

        result.valid = true;
        result
    }

    /// Verify a manifest's whole-document signature
    ///
    /// The signed payload is the manifest serialised with its signature
    /// field omitted (see [`MarketplaceManifest::signing_bytes`]).
    pub fn verify_manifest(&self, manifest: &MarketplaceManifest) -> VerificationResult {
        if manifest.signature.is_empty() {
            return VerificationResult::failed(VerificationFailure::ManifestUnsigned);
        }

        match manifest.signing_bytes() {
            Ok(bytes) => self.verify_signature(&bytes, &manifest.signature),
            Err(e) => VerificationResult::failed(VerificationFailure::ManifestEncoding(e.to_string())),
        }
    }

    /// Add or replace a trusted public key
    pub fn add_trusted_key(&self, name: impl Into<String>, key: VerifyingKey) {
        let name = name.into();
        let mut keys = self
            .trusted_keys
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(slot) = keys.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = key;
        } else {
            keys.push((name, key));
        }
    }

    /// Add or replace a trusted public key given in base64
    pub fn add_trusted_key_base64(&self, name: impl Into<String>, base64_key: &str) -> Result<()> {
        let key = decode_public_key(base64_key)?;
        self.add_trusted_key(name, key);
        Ok(())
    }

    /// Remove a trusted key by name
    pub fn remove_trusted_key(&self, name: &str) {
        self.trusted_keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(n, _)| n != name);
    }

    /// Names of all trusted keys, in insertion order
    pub fn trusted_key_names(&self) -> Vec<String> {
        self.trusted_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn has_trusted_keys(&self) -> bool {
        !self
            .trusted_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Decode and size-check a base64 signature
fn parse_signature(signature_base64: &str) -> Result<Signature, VerificationFailure> {
    let bytes = BASE64
        .decode(signature_base64)
        .map_err(|e| VerificationFailure::SignatureEncoding(e.to_string()))?;

    let sig_bytes: [u8; SIGNATURE_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| VerificationFailure::SignatureSize(bytes.len()))?;

    Ok(Signature::from_bytes(&sig_bytes))
}

/// Compute the SHA-256 hash of `data` and return hex string
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Sign `data` and return the base64 signature
pub fn sign_data(data: &[u8], key: &SigningKey) -> String {
    BASE64.encode(key.sign(data).to_bytes())
}

/// Generate a new random Ed25519 key pair
pub fn generate_key_pair() -> (VerifyingKey, SigningKey) {
    let signing_key = SigningKey::generate(&mut OsRng);
    (signing_key.verifying_key(), signing_key)
}

/// Encode a public key to base64
pub fn encode_public_key(key: &VerifyingKey) -> String {
    BASE64.encode(key.as_bytes())
}

/// Encode a private key to base64 (64-byte seed followed by public key)
pub fn encode_private_key(key: &SigningKey) -> String {
    BASE64.encode(key.to_keypair_bytes())
}

/// Decode a base64 public key
pub fn decode_public_key(base64_key: &str) -> Result<VerifyingKey> {
    let bytes = BASE64
        .decode(base64_key)
        .map_err(|e| MarketplaceError::InvalidKey(format!("decode public key: {}", e)))?;

    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| MarketplaceError::InvalidKey(format!("invalid public key size: {}", bytes.len())))?;

    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| MarketplaceError::InvalidKey(format!("invalid public key: {}", e)))
}

/// Decode a base64 private key (64-byte seed followed by public key)
pub fn decode_private_key(base64_key: &str) -> Result<SigningKey> {
    let bytes = BASE64
        .decode(base64_key)
        .map_err(|e| MarketplaceError::InvalidKey(format!("decode private key: {}", e)))?;

    let key_bytes: [u8; KEYPAIR_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| MarketplaceError::InvalidKey(format!("invalid private key size: {}", bytes.len())))?;

    SigningKey::from_keypair_bytes(&key_bytes)
        .map_err(|e| MarketplaceError::InvalidKey(format!("invalid private key: {}", e)))
}
