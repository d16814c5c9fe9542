//! Nexus Plugin SDK
//!
//! Shared interchange types for the plugin marketplace. These structures are
//! the wire and on-disk formats exchanged between registries, the
//! marketplace installer, and the runtime that later loads an installed
//! plugin. This crate performs no I/O.

/// Registry-published manifest types
pub mod manifest;

/// Local installation records and operation options
pub mod types;

// Re-export commonly used types
pub use manifest::{ArtifactFormat, MarketplaceManifest, PluginArtifact, RegistryIndex, ANY_PLATFORM};
pub use types::{
    InstallOptions, InstalledPlugin, PluginConfig, PluginIndex, PluginSearchResult, UpdateOptions,
};

/// File name of the manifest written next to every installed plugin binary
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// File name of a bare plugin binary at the root of a plugin directory
pub const DEFAULT_BINARY_FILENAME: &str = "plugin.so";
