//! Error types and handling
//!
//! Every public marketplace operation returns a single [`MarketplaceError`].
//! All errors implement [`MarketplaceErrorExt`], which provides a short hint
//! suitable for end users and tells callers whether retrying can help.

use thiserror::Error;

use crate::verifier::VerificationFailure;

/// Trait for marketplace error extensions
pub trait MarketplaceErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors need operator attention (tampered artifacts, a half-rolled-back
    /// activation).
    fn is_recoverable(&self) -> bool;
}

/// Marketplace error type
///
/// # Error Categories
///
/// - **Configuration**: bad store path, invalid config values
/// - **Network**: registry fetches and artifact downloads
/// - **Decode**: malformed registry or manifest JSON
/// - **Verification**: checksum or signature mismatch
/// - **Extraction**: unsupported format, missing binary or manifest
/// - **Activation**: rename failures while swapping plugin directories
/// - **Store**: install-state conflicts and index persistence
#[derive(Debug, Error)]
pub enum MarketplaceError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Registry {url} returned {status}: {body}")]
    RegistryStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Failed to fetch any registries: {}", .0.join("; "))]
    AllRegistriesFailed(Vec<String>),

    // Decode errors
    #[error("Decode error: {0}")]
    Decode(String),

    // Verification errors
    #[error("Artifact verification failed: {0}")]
    Verification(#[from] VerificationFailure),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // Installation errors
    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Activation failed: {0}")]
    Activation(String),

    #[error("Plugin already installed: {id} (version {version}). Use force to reinstall")]
    AlreadyInstalled { id: String, version: String },

    #[error("Plugin directory {path} is already used by {owner}")]
    DirectoryInUse { path: String, owner: String },

    #[error("Plugin not installed: {0}")]
    NotInstalled(String),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Requested version {requested} not found (available: {available})")]
    VersionUnavailable { requested: String, available: String },

    #[error("No compatible artifact for {os}/{arch}")]
    NoCompatibleArtifact { os: String, arch: String },

    #[error("Already at latest version: {0}")]
    UpToDate(String),

    // Store errors
    #[error("Invalid plugin record: {0}")]
    InvalidPlugin(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Corrupted plugin index: {0}")]
    Corruption(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for MarketplaceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for MarketplaceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl MarketplaceErrorExt for MarketplaceError {
    fn user_hint(&self) -> &str {
        match self {
            // Configuration errors
            Self::Config(_) => "Check your marketplace.toml file for errors",

            // Network errors
            Self::Network(_) => "Network operation failed. Check your connection",
            Self::RegistryStatus { .. } => "The plugin registry rejected the request. Try again later",
            Self::AllRegistriesFailed(_) => "No plugin registry could be reached. Check your registries",

            // Decode errors
            Self::Decode(_) => "The registry returned data that could not be read",

            // Verification errors
            Self::Verification(_) => "Security verification failed. Artifact may be tampered",
            Self::InvalidKey(_) => "Trusted key is malformed. Expected a base64 Ed25519 key",

            // Installation errors
            Self::Extraction(_) => "The plugin package is malformed or unsupported",
            Self::Activation(_) => "Plugin files could not be swapped into place. Check the plugin directory",
            Self::AlreadyInstalled { .. } => "Plugin is already installed. Use force to reinstall",
            Self::DirectoryInUse { .. } => "Another installed plugin has the same name. Uninstall it first",
            Self::NotInstalled(_) => "Plugin is not installed",
            Self::PluginNotFound(_) => "No registry lists this plugin",
            Self::VersionUnavailable { .. } => "Requested version is not published",
            Self::NoCompatibleArtifact { .. } => "Plugin has no build for this platform",
            Self::UpToDate(_) => "Plugin is already up to date",

            // Store errors
            Self::InvalidPlugin(_) => "Plugin record is invalid",
            Self::Store(_) => "Failed to save plugin index. Check disk space and permissions",
            Self::Corruption(_) => "Plugin index was corrupted and has been reset",

            // Generic IO error
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Verification(_) | Self::Activation(_) | Self::Corruption(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}

/// Result alias used across the marketplace
pub type Result<T, E = MarketplaceError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_installed_message() {
        let err = MarketplaceError::AlreadyInstalled {
            id: "pkg".to_string(),
            version: "1.0.0".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("already installed"));
        assert!(msg.contains("1.0.0"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_verification_is_fatal() {
        let err = MarketplaceError::from(VerificationFailure::MissingSignature);
        assert!(!err.is_recoverable());
        assert!(err.user_hint().contains("tampered"));
    }

    #[test]
    fn test_all_registries_failed_lists_each() {
        let err = MarketplaceError::AllRegistriesFailed(vec![
            "https://a: timeout".to_string(),
            "https://b: 500".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("https://a: timeout"));
        assert!(msg.contains("https://b: 500"));
    }
}
