//! Installation records and operation options

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::manifest::MarketplaceManifest;

/// Opaque per-plugin configuration
pub type PluginConfig = HashMap<String, serde_json::Value>;

/// A plugin installed in the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledPlugin {
    pub id: String,
    pub version: String,
    /// Live plugin directory
    pub path: PathBuf,
    pub binary_path: PathBuf,
    pub manifest_path: PathBuf,
    /// SHA-256 of the downloaded artifact
    pub checksum: String,
    /// SHA-256 of the extracted binary, empty for older records
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub binary_checksum: String,
    pub verified: bool,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Registry URL the plugin was installed from
    pub source: String,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: PluginConfig,
    #[serde(default)]
    pub manifest: Option<MarketplaceManifest>,
}

impl InstalledPlugin {
    /// Description from the manifest snapshot, if any
    pub fn description(&self) -> Option<&str> {
        self.manifest
            .as_ref()
            .map(|m| m.description.as_str())
            .filter(|d| !d.is_empty())
    }
}

fn default_true() -> bool {
    true
}

/// Root document of the local store (`index.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginIndex {
    #[serde(default)]
    pub plugins: BTreeMap<String, InstalledPlugin>,
    #[serde(default)]
    pub registries: Vec<String>,
    #[serde(default)]
    pub last_updated: DateTime<Utc>,
}

impl PluginIndex {
    /// Create an empty index stamped with the current time
    pub fn new() -> Self {
        Self {
            plugins: BTreeMap::new(),
            registries: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

/// Options for installing a plugin
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Exact version to require; `None` accepts whatever the registry serves
    pub version: Option<String>,
    /// Reinstall even if already installed
    pub force: bool,
    /// Skip checksum and signature verification
    pub skip_verify: bool,
    pub auto_update: bool,
    pub config: PluginConfig,
}

/// Options for updating an installed plugin
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub version: Option<String>,
    /// Reinstall even when the registry version is unchanged
    pub force: bool,
    pub skip_verify: bool,
}

/// One ranked search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSearchResult {
    pub plugin: MarketplaceManifest,
    pub score: f64,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub installed_version: Option<String>,
    #[serde(default)]
    pub update_available: bool,
}

impl PluginSearchResult {
    pub fn new(plugin: MarketplaceManifest, score: f64) -> Self {
        Self {
            plugin,
            score,
            installed: false,
            installed_version: None,
            update_available: false,
        }
    }
}
