//! Plugin installer: download, verify, stage, activate
//!
//! The installer drives a plugin from a registry manifest to a live
//! directory in the store. Artifact bytes are verified in memory before
//! anything touches disk, extracted into a staging directory inside the store
//! base (same filesystem, so activation is a rename), and only then swapped
//! in. A failed metadata write rolls the swap back.
//!
//! The installer does no locking of its own; callers must not run two
//! mutating operations on the same plugin ID at once.

use chrono::Utc;
use pluginsdk::{
    InstallOptions, InstalledPlugin, MarketplaceManifest, PluginArtifact, UpdateOptions,
    MANIFEST_FILENAME,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{MarketplaceError, Result};
use crate::extract::extract_artifact;
use crate::registry::{artifact_for_os, current_arch, current_os, RegistryClient};
use crate::staging::{discard_backup, rollback_install, stage_install};
use crate::store::Store;
use crate::verifier::{compute_checksum, VerificationResult, Verifier};

const STAGING_PREFIX: &str = ".install-";

/// Outcome of an install or update
#[derive(Debug, Clone, PartialEq)]
pub struct InstallResult {
    pub plugin: InstalledPlugin,
    /// No previous version was installed
    pub installed: bool,
    /// A previous version was replaced
    pub updated: bool,
    pub previous_version: Option<String>,
}

/// Installs, updates and removes plugins
pub struct Installer {
    store: Arc<Store>,
    registry: Arc<RegistryClient>,
    verifier: Arc<Verifier>,
    os: String,
    arch: String,
}

impl Installer {
    pub fn new(store: Arc<Store>, registry: Arc<RegistryClient>, verifier: Arc<Verifier>) -> Self {
        Self {
            store,
            registry,
            verifier,
            os: current_os().to_string(),
            arch: current_arch().to_string(),
        }
    }

    /// Select artifacts for another platform than the running one
    pub fn with_platform(mut self, os: impl Into<String>, arch: impl Into<String>) -> Self {
        self.os = os.into();
        self.arch = arch.into();
        self
    }

    /// Install a plugin from the configured registries
    pub async fn install(&self, id: &str, opts: InstallOptions) -> Result<InstallResult> {
        info!("Installing plugin: {} (version {:?})", id, opts.version);

        let existing = self.store.get(id);
        if let Some(existing) = &existing {
            if !opts.force {
                return Err(MarketplaceError::AlreadyInstalled {
                    id: id.to_string(),
                    version: existing.version.clone(),
                });
            }
        }

        if let Some(owner) = self.directory_owner(id) {
            return Err(MarketplaceError::DirectoryInUse {
                path: owner.path.display().to_string(),
                owner: owner.id,
            });
        }

        let (manifest, registry_url) = self.registry.get_plugin(id).await?;

        if let Some(requested) = opts.version.as_deref().filter(|v| !v.is_empty()) {
            if requested != manifest.version {
                return Err(MarketplaceError::VersionUnavailable {
                    requested: requested.to_string(),
                    available: manifest.version.clone(),
                });
            }
        }

        let artifact = artifact_for_os(&manifest, &self.os, &self.arch)
            .cloned()
            .ok_or_else(|| MarketplaceError::NoCompatibleArtifact {
                os: self.os.clone(),
                arch: self.arch.clone(),
            })?;

        let data = self.registry.download_artifact(&artifact).await?;

        if !opts.skip_verify {
            let result = self.verifier.verify_artifact(&data, &artifact).ensure_valid()?;
            info!(
                "Artifact verified: {} (signed by {})",
                result.computed_checksum,
                result.signed_by.as_deref().unwrap_or("nobody")
            );
        } else {
            warn!("Skipping verification for {}", id);
        }

        let checksum = compute_checksum(&data);

        let stage = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(self.store.base_path())
            .map_err(|e| MarketplaceError::Extraction(format!("create staging dir: {}", e)))?;

        let (binary, binary_checksum) =
            extract_in_background(data, artifact, stage.path().to_path_buf()).await?;
        write_manifest(stage.path(), &manifest).await?;

        let relative_binary = binary
            .strip_prefix(stage.path())
            .map(Path::to_path_buf)
            .map_err(|_| {
                MarketplaceError::Extraction(format!(
                    "binary {} is outside the staging dir",
                    binary.display()
                ))
            })?;

        let live = self.store.plugin_path(id);
        let backup = stage_install(stage.path(), &live, |from, to| std::fs::rename(from, to))?;

        let now = Utc::now();
        let record = InstalledPlugin {
            id: id.to_string(),
            version: manifest.version.clone(),
            path: live.clone(),
            binary_path: live.join(relative_binary),
            manifest_path: live.join(MANIFEST_FILENAME),
            checksum,
            binary_checksum,
            verified: !opts.skip_verify,
            installed_at: existing.as_ref().map_or(now, |p| p.installed_at),
            updated_at: now,
            source: registry_url,
            auto_update: opts.auto_update,
            enabled: true,
            config: opts.config,
            manifest: Some(manifest),
        };

        let saved = {
            let record = record.clone();
            store_in_background(&self.store, move |store| store.add(record)).await
        };
        if let Err(e) = saved {
            return Err(match rollback_install(&live, backup.as_deref()) {
                Ok(()) => {
                    warn!("Rolled back {} after failing to record it: {}", id, e);
                    e
                }
                Err(rollback_err) => MarketplaceError::Activation(format!(
                    "save to store: {}; rollback failed: {}",
                    e, rollback_err
                )),
            });
        }

        if let Some(backup) = &backup {
            discard_backup(backup);
        }

        info!(
            "Installed plugin {} v{} to {}",
            id,
            record.version,
            live.display()
        );

        let previous_version = existing.map(|p| p.version);
        Ok(InstallResult {
            plugin: record,
            installed: previous_version.is_none(),
            updated: previous_version.is_some(),
            previous_version,
        })
    }

    /// Update an installed plugin to the registry's current version
    ///
    /// Keeps the plugin's auto-update flag and configuration.
    pub async fn update(&self, id: &str, opts: UpdateOptions) -> Result<InstallResult> {
        info!("Updating plugin: {}", id);

        let existing = self
            .store
            .get(id)
            .ok_or_else(|| MarketplaceError::NotInstalled(id.to_string()))?;

        let (manifest, _) = self.registry.get_plugin(id).await?;
        if manifest.version == existing.version && !opts.force {
            return Err(MarketplaceError::UpToDate(manifest.version));
        }

        let install_opts = InstallOptions {
            version: opts.version,
            force: true,
            skip_verify: opts.skip_verify,
            auto_update: existing.auto_update,
            config: existing.config,
        };
        self.install(id, install_opts).await
    }

    /// Remove a plugin's files and its record
    ///
    /// Failing to delete the directory is logged; failing to drop the
    /// record is an error.
    pub async fn uninstall(&self, id: &str) -> Result<()> {
        info!("Uninstalling plugin: {}", id);

        let existing = self
            .store
            .get(id)
            .ok_or_else(|| MarketplaceError::NotInstalled(id.to_string()))?;

        if let Some(owner) = self.directory_owner(id) {
            warn!(
                "Keeping {}: it belongs to {}",
                existing.path.display(),
                owner.id
            );
        } else {
            let dir_id = id.to_string();
            let removed =
                store_in_background(&self.store, move |store| store.remove_plugin_dir(&dir_id))
                    .await;
            if let Err(e) = removed {
                warn!(
                    "Failed to remove plugin directory {}: {}",
                    existing.path.display(),
                    e
                );
            }
        }

        let record_id = id.to_string();
        store_in_background(&self.store, move |store| store.remove(&record_id)).await?;
        info!("Uninstalled plugin {} v{}", id, existing.version);
        Ok(())
    }

    /// Re-hash the installed binary and compare with the recorded checksum
    pub async fn verify_installed(&self, id: &str) -> Result<VerificationResult> {
        let installed = self
            .store
            .get(id)
            .ok_or_else(|| MarketplaceError::NotInstalled(id.to_string()))?;

        let data = tokio::fs::read(&installed.binary_path).await?;

        let expected = if installed.binary_checksum.is_empty() {
            &installed.checksum
        } else {
            &installed.binary_checksum
        };

        let result = self.verifier.verify_checksum(&data, expected);
        if result.valid {
            info!("Plugin {} verified: {}", id, result.computed_checksum);
        } else {
            warn!("Plugin {} failed verification", id);
        }
        Ok(result)
    }

    /// Update every enabled plugin flagged for auto-update, one at a time
    ///
    /// Per-plugin failures are logged, not returned. Only plugins that were
    /// actually updated appear in the result.
    pub async fn update_all(&self) -> Result<Vec<InstallResult>> {
        let mut results = Vec::new();
        let mut failures = 0usize;

        for plugin in self.store.plugins_needing_update() {
            match self.update(&plugin.id, UpdateOptions::default()).await {
                Ok(result) if result.updated => results.push(result),
                Ok(_) => {}
                Err(MarketplaceError::UpToDate(version)) => {
                    debug!("{} is up to date ({})", plugin.id, version);
                }
                Err(e) => {
                    warn!("Failed to update {}: {}", plugin.id, e);
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            warn!("{} plugin updates failed", failures);
        }
        Ok(results)
    }

    /// A record for a different ID that occupies `id`'s plugin directory
    fn directory_owner(&self, id: &str) -> Option<InstalledPlugin> {
        let live = self.store.plugin_path(id);
        self.store
            .list()
            .into_iter()
            .find(|p| p.id != id && (p.path == live || self.store.plugin_path(&p.id) == live))
    }

    /// Map of plugin ID to the newer version a registry offers
    pub async fn check_updates(&self) -> Result<HashMap<String, String>> {
        let mut updates = HashMap::new();

        for installed in self.store.list() {
            match self.registry.get_plugin(&installed.id).await {
                Ok((manifest, _)) => {
                    if is_newer_version(&manifest.version, &installed.version) {
                        updates.insert(installed.id, manifest.version);
                    }
                }
                Err(e) => debug!("Failed to check update for {}: {}", installed.id, e),
            }
        }

        Ok(updates)
    }
}

/// Whether `candidate` should replace `installed`
///
/// Compares as semver when both parse, otherwise any difference counts.
pub fn is_newer_version(candidate: &str, installed: &str) -> bool {
    match (semver::Version::parse(candidate), semver::Version::parse(installed)) {
        (Ok(candidate), Ok(installed)) => candidate > installed,
        _ => candidate != installed,
    }
}

/// Extract on the blocking pool and hash the resulting binary
async fn extract_in_background(
    data: Vec<u8>,
    artifact: PluginArtifact,
    stage: PathBuf,
) -> Result<(PathBuf, String)> {
    tokio::task::spawn_blocking(move || -> Result<(PathBuf, String)> {
        let binary = extract_artifact(&data, &artifact, &stage)?;
        let bytes = std::fs::read(&binary).map_err(|e| {
            MarketplaceError::Extraction(format!("read {}: {}", binary.display(), e))
        })?;
        Ok((binary, compute_checksum(&bytes)))
    })
    .await
    .map_err(|e| MarketplaceError::Extraction(format!("extraction task failed: {}", e)))?
}

/// Run a store write on the blocking pool
///
/// Index saves create, sync and rename files while holding the store lock.
async fn store_in_background<T, F>(store: &Arc<Store>, f: F) -> Result<T>
where
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| MarketplaceError::Store(format!("store task failed: {}", e)))?
}

/// Write `manifest.json` into the staging dir and confirm both files exist
async fn write_manifest(stage: &Path, manifest: &MarketplaceManifest) -> Result<()> {
    let path = stage.join(MANIFEST_FILENAME);
    tokio::fs::write(&path, manifest.to_json()?)
        .await
        .map_err(|e| MarketplaceError::Extraction(format!("save manifest: {}", e)))?;

    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(MarketplaceError::Extraction(
            "plugin manifest missing after write".to_string(),
        ));
    }
    Ok(())
}
