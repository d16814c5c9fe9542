//! Marketplace manager: the public façade
//!
//! Wires the store, registry client, verifier and installer together.
//! Mutating calls take a per-directory async lock, so two operations on the
//! same plugin directory never interleave while unrelated IDs proceed in
//! parallel.
//! Read-only calls go straight to the components.

use pluginsdk::{
    InstallOptions, InstalledPlugin, MarketplaceManifest, PluginConfig, PluginSearchResult,
    UpdateOptions,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::default_store_path;
use crate::error::{MarketplaceError, Result};
use crate::installer::{is_newer_version, InstallResult, Installer};
use crate::registry::{
    artifact_for_platform, current_arch, current_os, RegistryClient, SearchOptions,
    DEFAULT_REGISTRY_URL,
};
use crate::store::{sanitize_id, Store};
use crate::verifier::{SignaturePolicy, VerificationResult, Verifier};

/// Characters never allowed in a plugin ID
const INVALID_ID_CHARS: &[char] = &['\\', ':', '*', '?', '"', '<', '>', '|'];

/// Settings for [`Manager::new`]
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Store directory, `~/.nexus/plugins` when unset
    pub base_path: Option<PathBuf>,
    /// Registry URLs; falls back to the store's list, then the default
    pub registries: Vec<String>,
    /// Trusted key name to base64 Ed25519 public key
    pub trusted_keys: BTreeMap<String, String>,
    pub cache_ttl: Option<Duration>,
    pub signature_policy: SignaturePolicy,
}

/// Marketplace status summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketplaceInfo {
    pub store_path: PathBuf,
    pub registries: Vec<String>,
    pub installed_count: usize,
    pub enabled_count: usize,
    pub auto_update_count: usize,
    pub has_trusted_keys: bool,
    pub trusted_key_names: Vec<String>,
    /// `os/arch` of the running process
    pub platform: String,
}

/// Everything known about one plugin, locally and remotely
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfoResult {
    pub id: String,
    pub installed: Option<InstalledPlugin>,
    pub manifest: Option<MarketplaceManifest>,
    /// Registry the manifest came from
    pub source: Option<String>,
    /// A registry artifact exists for this platform
    pub compatible: bool,
    pub update_available: bool,
}

/// Plugin marketplace façade
pub struct Manager {
    store: Arc<Store>,
    registry: Arc<RegistryClient>,
    verifier: Arc<Verifier>,
    installer: Installer,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Manager {
    /// Build a manager from its configuration
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let base_path = match config.base_path {
            Some(path) => path,
            None => default_store_path()?,
        };
        let store = Arc::new(Store::open(base_path)?);

        let registries = if !config.registries.is_empty() {
            config.registries
        } else {
            let persisted = store.registries();
            if persisted.is_empty() {
                vec![DEFAULT_REGISTRY_URL.to_string()]
            } else {
                persisted
            }
        };

        let mut registry = RegistryClient::new(registries)?;
        if let Some(ttl) = config.cache_ttl {
            registry = registry.with_cache_ttl(ttl);
        }
        let registry = Arc::new(registry);

        let mut verifier = Verifier::new().with_signature_policy(config.signature_policy);
        for (name, key) in &config.trusted_keys {
            verifier = verifier.with_trusted_key_base64(name.clone(), key);
        }
        let verifier = Arc::new(verifier);

        let installer = Installer::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&verifier),
        );

        info!(
            "Marketplace ready at {} ({} registries, {} trusted keys)",
            store.base_path().display(),
            registry.registries().len(),
            verifier.trusted_key_names().len()
        );

        Ok(Self {
            store,
            registry,
            verifier,
            installer,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Search registries and flag what is already installed
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<PluginSearchResult>> {
        let mut results = self.registry.search(query, opts).await?;

        for result in &mut results {
            if let Some(installed) = self.store.get(&result.plugin.id) {
                result.installed = true;
                result.update_available = is_newer_version(&result.plugin.version, &installed.version);
                result.installed_version = Some(installed.version);
            }
        }

        Ok(results)
    }

    /// Registry manifest for a plugin
    pub async fn get_plugin(&self, id: &str) -> Result<MarketplaceManifest> {
        let (manifest, _) = self.registry.get_plugin(id).await?;
        Ok(manifest)
    }

    pub async fn install(&self, id: &str, opts: InstallOptions) -> Result<InstallResult> {
        validate_plugin_id(id)?;
        let lock = self.plugin_lock(id);
        let _guard = lock.lock().await;
        self.installer.install(id, opts).await
    }

    pub async fn update(&self, id: &str, opts: UpdateOptions) -> Result<InstallResult> {
        let lock = self.plugin_lock(id);
        let _guard = lock.lock().await;
        self.installer.update(id, opts).await
    }

    /// Update every auto-update plugin, holding each plugin's lock in turn
    ///
    /// Failures are logged and skipped; only real updates are returned.
    pub async fn update_all(&self) -> Result<Vec<InstallResult>> {
        let mut results = Vec::new();

        for plugin in self.store.plugins_needing_update() {
            let lock = self.plugin_lock(&plugin.id);
            let _guard = lock.lock().await;

            match self.installer.update(&plugin.id, UpdateOptions::default()).await {
                Ok(result) if result.updated => results.push(result),
                Ok(_) => {}
                Err(MarketplaceError::UpToDate(_)) => debug!("{} is up to date", plugin.id),
                Err(e) => warn!("Failed to update {}: {}", plugin.id, e),
            }
        }

        Ok(results)
    }

    pub async fn uninstall(&self, id: &str) -> Result<()> {
        let lock = self.plugin_lock(id);
        let _guard = lock.lock().await;
        self.installer.uninstall(id).await
    }

    /// Re-check an installed plugin's binary
    pub async fn verify(&self, id: &str) -> Result<VerificationResult> {
        self.installer.verify_installed(id).await
    }

    pub fn list(&self) -> Vec<InstalledPlugin> {
        self.store.list()
    }

    pub fn get(&self, id: &str) -> Option<InstalledPlugin> {
        self.store.get(id)
    }

    pub fn is_installed(&self, id: &str) -> bool {
        self.store.is_installed(id)
    }

    pub fn enable(&self, id: &str) -> Result<()> {
        self.store.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> Result<()> {
        self.store.set_enabled(id, false)
    }

    pub fn set_auto_update(&self, id: &str, auto_update: bool) -> Result<()> {
        self.store.set_auto_update(id, auto_update)
    }

    pub fn set_config(&self, id: &str, config: PluginConfig) -> Result<()> {
        self.store.set_config(id, config)
    }

    pub fn enabled_plugins(&self) -> Vec<InstalledPlugin> {
        self.store.enabled_plugins()
    }

    pub async fn check_updates(&self) -> Result<HashMap<String, String>> {
        self.installer.check_updates().await
    }

    pub fn registries(&self) -> Vec<String> {
        self.registry.registries()
    }

    /// Add a registry and persist the list with the store
    pub fn add_registry(&self, url: &str) -> Result<()> {
        self.registry.add_registry(url);
        self.store.set_registries(self.registry.registries())
    }

    pub fn clear_cache(&self) {
        self.registry.clear_cache();
    }

    /// Re-read the store index from disk
    pub fn reload(&self) -> Result<()> {
        self.store.reload()
    }

    pub fn info(&self) -> MarketplaceInfo {
        let installed = self.store.list();

        MarketplaceInfo {
            store_path: self.store.base_path().to_path_buf(),
            registries: self.registry.registries(),
            installed_count: installed.len(),
            enabled_count: installed.iter().filter(|p| p.enabled).count(),
            auto_update_count: installed.iter().filter(|p| p.auto_update).count(),
            has_trusted_keys: self.verifier.has_trusted_keys(),
            trusted_key_names: self.verifier.trusted_key_names(),
            platform: format!("{}/{}", current_os(), current_arch()),
        }
    }

    /// Local record plus registry view of a plugin
    ///
    /// Registry failures are not errors here; the remote fields stay empty.
    pub async fn plugin_info(&self, id: &str) -> PluginInfoResult {
        let installed = self.store.get(id);
        let mut result = PluginInfoResult {
            id: id.to_string(),
            installed,
            manifest: None,
            source: None,
            compatible: false,
            update_available: false,
        };

        match self.registry.get_plugin(id).await {
            Ok((manifest, source)) => {
                result.compatible = artifact_for_platform(&manifest).is_some();
                result.update_available = result
                    .installed
                    .as_ref()
                    .is_some_and(|p| is_newer_version(&manifest.version, &p.version));
                result.manifest = Some(manifest);
                result.source = Some(source);
            }
            Err(e) => debug!("No registry info for {}: {}", id, e),
        }

        result
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RegistryClient> {
        &self.registry
    }

    pub fn verifier(&self) -> &Arc<Verifier> {
        &self.verifier
    }

    /// Lock serialising mutations of one plugin directory
    ///
    /// Keyed like the directory itself, so IDs that share a directory name
    /// share a lock.
    fn plugin_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(sanitize_id(id)).or_default())
    }
}

/// Reject IDs that are blank or contain characters unsafe in file names
pub fn validate_plugin_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(MarketplaceError::InvalidPlugin(
            "plugin ID is required".to_string(),
        ));
    }
    if id.contains(INVALID_ID_CHARS) {
        return Err(MarketplaceError::InvalidPlugin(format!(
            "plugin ID contains invalid characters: {}",
            id
        )));
    }
    Ok(())
}

/// Display form of an ID, without any `org/` prefix
pub fn format_plugin_id(id: &str) -> &str {
    id.rsplit_once('/').map_or(id, |(_, name)| name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager_at(dir: &TempDir, registries: Vec<String>) -> Manager {
        Manager::new(ManagerConfig {
            base_path: Some(dir.path().to_path_buf()),
            registries,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_validate_plugin_id() {
        assert!(validate_plugin_id("slack").is_ok());
        assert!(validate_plugin_id("org/slack").is_ok());
        assert!(validate_plugin_id("").is_err());
        assert!(validate_plugin_id("   ").is_err());
        assert!(validate_plugin_id("C:plugin").is_err());
        assert!(validate_plugin_id("a*b").is_err());
        assert!(validate_plugin_id("a\\b").is_err());
    }

    #[test]
    fn test_format_plugin_id() {
        assert_eq!(format_plugin_id("nexus/slack"), "slack");
        assert_eq!(format_plugin_id("a/b/c"), "c");
        assert_eq!(format_plugin_id("slack"), "slack");
    }

    #[test]
    fn test_registry_precedence() {
        let dir = TempDir::new().unwrap();

        let manager = manager_at(&dir, vec![]);
        assert_eq!(manager.registries(), vec![DEFAULT_REGISTRY_URL]);

        manager.add_registry("https://mirror.test").unwrap();
        drop(manager);

        // Persisted list wins over the default
        let manager = manager_at(&dir, vec![]);
        assert_eq!(
            manager.registries(),
            vec![DEFAULT_REGISTRY_URL, "https://mirror.test"]
        );
        drop(manager);

        // Explicit config wins over the persisted list
        let manager = manager_at(&dir, vec!["https://explicit.test".to_string()]);
        assert_eq!(manager.registries(), vec!["https://explicit.test"]);
    }

    #[test]
    fn test_plugin_lock_is_shared_per_id() {
        let dir = TempDir::new().unwrap();
        let manager = manager_at(&dir, vec![]);

        let a1 = manager.plugin_lock("a");
        let a2 = manager.plugin_lock("a");
        let b = manager.plugin_lock("b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        // Same directory, same lock
        let scoped = manager.plugin_lock("org/a");
        let other_scope = manager.plugin_lock("other/a");
        assert!(Arc::ptr_eq(&a1, &scoped));
        assert!(Arc::ptr_eq(&scoped, &other_scope));
    }

    #[test]
    fn test_info_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let (public, _) = crate::verifier::generate_key_pair();
        let mut trusted_keys = BTreeMap::new();
        trusted_keys.insert(
            "official".to_string(),
            crate::verifier::encode_public_key(&public),
        );
        trusted_keys.insert("broken".to_string(), "%%%".to_string());

        let manager = Manager::new(ManagerConfig {
            base_path: Some(dir.path().to_path_buf()),
            trusted_keys,
            ..Default::default()
        })
        .unwrap();

        let info = manager.info();
        assert_eq!(info.store_path, dir.path());
        assert_eq!(info.installed_count, 0);
        assert!(info.has_trusted_keys);
        assert_eq!(info.trusted_key_names, vec!["official"]);
        assert!(info.platform.contains('/'));
    }

    #[tokio::test]
    async fn test_install_rejects_invalid_id() {
        let dir = TempDir::new().unwrap();
        let manager = manager_at(&dir, vec![]);

        let err = manager
            .install("bad|id", InstallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::InvalidPlugin(_)));
    }
}
