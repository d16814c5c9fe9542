//! Marketplace configuration
//!
//! Stored as TOML at `~/.nexus/marketplace.toml`. Every field has a default,
//! so a partial file (or none at all) is valid.
//!
//! ```toml
//! store_path = "~/.nexus/plugins"
//! registries = ["https://plugins.nexus.dev"]
//! require_signatures = false
//!
//! [trusted_keys]
//! official = "<base64 ed25519 public key>"
//! ```
//!
//! Loading expands `~` in the store path and validates registry URLs and
//! trusted keys before anything is handed to the [`Manager`](crate::Manager).

use pluginsdk::InstallOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MarketplaceError, Result};
use crate::manager::ManagerConfig;
use crate::registry::DEFAULT_CACHE_TTL;
use crate::verifier::{decode_public_key, SignaturePolicy};

const CONFIG_DIR: &str = ".nexus";
const CONFIG_FILENAME: &str = "marketplace.toml";
const PLUGINS_DIR: &str = "plugins";

/// Marketplace settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    /// Plugin store directory (`~` is expanded)
    #[serde(default = "default_store_path_setting")]
    pub store_path: PathBuf,

    /// Registry URLs, searched in order
    ///
    /// Left empty, the manager uses the registries persisted in the store
    /// and falls back to the public registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registries: Vec<String>,

    /// Default auto-update flag for new installs
    #[serde(default)]
    pub auto_update: bool,

    /// Install without checksum or signature checks
    #[serde(default)]
    pub skip_verify: bool,

    /// Reject unsigned artifacts when trusted keys are configured
    #[serde(default)]
    pub require_signatures: bool,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Trusted key name to base64 Ed25519 public key
    #[serde(default)]
    pub trusted_keys: BTreeMap<String, String>,
}

fn default_store_path_setting() -> PathBuf {
    PathBuf::from("~").join(CONFIG_DIR).join(PLUGINS_DIR)
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path_setting(),
            registries: Vec::new(),
            auto_update: false,
            skip_verify: false,
            require_signatures: false,
            cache_ttl_secs: default_cache_ttl_secs(),
            log_level: default_log_level(),
            trusted_keys: BTreeMap::new(),
        }
    }
}

impl MarketplaceConfig {
    /// Load from `~/.nexus/marketplace.toml`, writing defaults if absent
    pub fn load_or_create() -> Result<Self> {
        Self::load_or_create_at(&default_config_path()?)
    }

    /// Load from `path`, writing defaults there if absent
    pub fn load_or_create_at(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            Self::create_default(path)
        }
    }

    /// Load and validate a configuration file
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| MarketplaceError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: MarketplaceConfig = toml::from_str(&contents)
            .map_err(|e| MarketplaceError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;
        Ok(config)
    }

    fn create_default(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                MarketplaceError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| MarketplaceError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| MarketplaceError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = Self::default();
        config.validate_and_process()?;
        Ok(config)
    }

    /// Check values and expand `~` in the store path
    fn validate_and_process(&mut self) -> Result<()> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(MarketplaceError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log_level,
                valid_log_levels.join(", ")
            )));
        }

        for url in &self.registries {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(MarketplaceError::Config(format!(
                    "Invalid registry URL '{}'. Must start with http:// or https://",
                    url
                )));
            }
        }

        for (name, key) in &self.trusted_keys {
            decode_public_key(key).map_err(|e| {
                MarketplaceError::Config(format!("Invalid trusted key '{}': {}", name, e))
            })?;
        }

        self.store_path = expand_path(&self.store_path)?;
        if self.store_path.exists() && !self.store_path.is_dir() {
            return Err(MarketplaceError::Config(format!(
                "Store path is not a directory: {:?}",
                self.store_path
            )));
        }

        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn signature_policy(&self) -> SignaturePolicy {
        if self.require_signatures {
            SignaturePolicy::Required
        } else {
            SignaturePolicy::Optional
        }
    }

    /// Install options carrying the configured defaults
    pub fn install_options(&self) -> InstallOptions {
        InstallOptions {
            skip_verify: self.skip_verify,
            auto_update: self.auto_update,
            ..Default::default()
        }
    }
}

impl From<&MarketplaceConfig> for ManagerConfig {
    fn from(config: &MarketplaceConfig) -> Self {
        ManagerConfig {
            base_path: Some(config.store_path.clone()),
            registries: config.registries.clone(),
            trusted_keys: config.trusted_keys.clone(),
            cache_ttl: Some(config.cache_ttl()),
            signature_policy: config.signature_policy(),
        }
    }
}

/// Default configuration file path (`~/.nexus/marketplace.toml`)
pub fn default_config_path() -> Result<PathBuf> {
    Ok(home_dir()?.join(CONFIG_DIR).join(CONFIG_FILENAME))
}

/// Default plugin store directory (`~/.nexus/plugins`)
pub fn default_store_path() -> Result<PathBuf> {
    Ok(home_dir()?.join(CONFIG_DIR).join(PLUGINS_DIR))
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .ok_or_else(|| MarketplaceError::Config("Could not determine home directory".to_string()))
}

/// Expand a leading `~` to the user's home directory
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| MarketplaceError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        Ok(home_dir()?.join(rest))
    } else if path_str == "~" {
        home_dir()
    } else {
        Ok(path.to_path_buf())
    }
}
