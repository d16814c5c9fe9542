//! Nexus Plugin Marketplace
//!
//! This crate finds, downloads, verifies, installs and manages third-party
//! binary plugins. Plugins are listed by HTTP registries, checked against a
//! SHA-256 checksum and optionally an Ed25519 signature, and activated into a
//! local store through a rename-based staging protocol.
//!
//! Most callers only need the [`Manager`] façade.

/// Configuration management module
pub mod config;

/// Error types and handling
pub mod error;

/// Archive extraction
pub mod extract;

/// Plugin install state machine
pub mod installer;

/// Marketplace façade
pub mod manager;

/// Registry HTTP client and search
pub mod registry;

/// Staged directory activation and rollback
pub mod staging;

/// Local plugin store
pub mod store;

/// Telemetry and Observability
pub mod telemetry;

/// Checksum and signature verification
pub mod verifier;

// Re-export commonly used types
pub use config::MarketplaceConfig;
pub use error::{MarketplaceError, MarketplaceErrorExt, Result};
pub use installer::{InstallResult, Installer};
pub use manager::{
    format_plugin_id, validate_plugin_id, Manager, ManagerConfig, MarketplaceInfo,
    PluginInfoResult,
};
pub use registry::{RegistryClient, SearchOptions, DEFAULT_REGISTRY_URL};
pub use store::Store;
pub use verifier::{SignaturePolicy, VerificationFailure, VerificationResult, Verifier};
