//! Local plugin store
//!
//! Persists the [`PluginIndex`] as `{base}/index.json` and owns one
//! sub-directory per installed plugin. All index access goes through a single
//! `RwLock`; every mutation rewrites the whole file before the in-memory copy
//! is committed, so readers never observe state that failed to persist.

use chrono::{Local, Utc};
use pluginsdk::{InstalledPlugin, PluginConfig, PluginIndex};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

use crate::error::{MarketplaceError, Result};

/// Name of the index file inside the store directory
pub const INDEX_FILENAME: &str = "index.json";

/// Directory name used for IDs that sanitise to nothing
const INVALID_ID_DIR: &str = "_invalid_";

/// Durable map of installed plugins
pub struct Store {
    base_path: PathBuf,
    index_path: PathBuf,
    index: RwLock<PluginIndex>,
}

impl Store {
    /// Open (or create) a store rooted at `base_path`
    ///
    /// A missing index starts empty. A malformed index is renamed aside to
    /// `index.json.corrupt-<timestamp>` and replaced with an empty one. Any
    /// other read failure is fatal.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).map_err(|e| {
            MarketplaceError::Config(format!(
                "Failed to create plugins directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        let index_path = base_path.join(INDEX_FILENAME);
        let index = load_index(&index_path)?;

        Ok(Self {
            base_path,
            index_path,
            index: RwLock::new(index),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Directory for a plugin, named by its sanitised ID
    pub fn plugin_path(&self, id: &str) -> PathBuf {
        self.base_path.join(sanitize_id(id))
    }

    /// Re-read the index from disk, replacing the in-memory copy
    ///
    /// Unlike [`Store::open`], a malformed file is reported as
    /// [`MarketplaceError::Corruption`] and the in-memory index is kept.
    pub fn reload(&self) -> Result<()> {
        let index = read_index_file(&self.index_path)?;
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;
        Ok(())
    }

    /// All installed plugins, ordered by ID
    pub fn list(&self) -> Vec<InstalledPlugin> {
        self.read_index().plugins.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<InstalledPlugin> {
        self.read_index().plugins.get(id).cloned()
    }

    pub fn is_installed(&self, id: &str) -> bool {
        self.read_index().plugins.contains_key(id)
    }

    /// Insert or replace a plugin record
    pub fn add(&self, plugin: InstalledPlugin) -> Result<()> {
        if plugin.id.is_empty() {
            return Err(MarketplaceError::InvalidPlugin(
                "plugin ID is required".to_string(),
            ));
        }

        self.mutate(|index| {
            index.plugins.insert(plugin.id.clone(), plugin);
            Ok(())
        })
    }

    /// Replace an existing plugin record, stamping `updated_at`
    pub fn update(&self, mut plugin: InstalledPlugin) -> Result<()> {
        self.mutate(|index| {
            if !index.plugins.contains_key(&plugin.id) {
                return Err(MarketplaceError::NotInstalled(plugin.id.clone()));
            }
            plugin.updated_at = Utc::now();
            index.plugins.insert(plugin.id.clone(), plugin);
            Ok(())
        })
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.mutate(|index| {
            index
                .plugins
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| MarketplaceError::NotInstalled(id.to_string()))
        })
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.modify_plugin(id, |plugin| plugin.enabled = enabled)
    }

    pub fn set_auto_update(&self, id: &str, auto_update: bool) -> Result<()> {
        self.modify_plugin(id, |plugin| plugin.auto_update = auto_update)
    }

    pub fn set_config(&self, id: &str, config: PluginConfig) -> Result<()> {
        self.modify_plugin(id, |plugin| plugin.config = config)
    }

    /// Plugins that are both enabled and flagged for auto-update
    pub fn plugins_needing_update(&self) -> Vec<InstalledPlugin> {
        self.read_index()
            .plugins
            .values()
            .filter(|p| p.enabled && p.auto_update)
            .cloned()
            .collect()
    }

    pub fn enabled_plugins(&self) -> Vec<InstalledPlugin> {
        self.read_index()
            .plugins
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect()
    }

    /// Registry URLs persisted with the index
    pub fn registries(&self) -> Vec<String> {
        self.read_index().registries.clone()
    }

    pub fn set_registries(&self, registries: Vec<String>) -> Result<()> {
        self.mutate(|index| {
            index.registries = registries;
            Ok(())
        })
    }

    /// Create the plugin directory if needed and return it
    pub fn ensure_plugin_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.plugin_path(id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove the plugin directory and everything in it
    ///
    /// A directory that does not exist is not an error.
    pub fn remove_plugin_dir(&self, id: &str) -> Result<()> {
        match fs::remove_dir_all(self.plugin_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn plugin_dir_exists(&self, id: &str) -> bool {
        self.plugin_path(id).is_dir()
    }

    /// Write a file inside the plugin directory
    pub fn write_plugin_file(&self, id: &str, filename: &str, data: &[u8], mode: u32) -> Result<()> {
        let path = self.ensure_plugin_dir(id)?.join(checked_filename(filename)?);
        fs::write(&path, data)?;
        set_mode(&path, mode)?;
        Ok(())
    }

    /// Read a file from the plugin directory
    pub fn read_plugin_file(&self, id: &str, filename: &str) -> Result<Vec<u8>> {
        let path = self.plugin_path(id).join(checked_filename(filename)?);
        Ok(fs::read(path)?)
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, PluginIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to a copy of the index, persist it, then commit it
    fn mutate<T>(&self, f: impl FnOnce(&mut PluginIndex) -> Result<T>) -> Result<T> {
        let mut guard = self.index.write().unwrap_or_else(PoisonError::into_inner);

        let mut next = guard.clone();
        let out = f(&mut next)?;
        next.last_updated = Utc::now();

        save_index(&self.base_path, &self.index_path, &next)?;
        *guard = next;
        Ok(out)
    }

    fn modify_plugin(&self, id: &str, f: impl FnOnce(&mut InstalledPlugin)) -> Result<()> {
        self.mutate(|index| {
            let plugin = index
                .plugins
                .get_mut(id)
                .ok_or_else(|| MarketplaceError::NotInstalled(id.to_string()))?;
            f(plugin);
            plugin.updated_at = Utc::now();
            Ok(())
        })
    }
}

fn read_index_file(index_path: &Path) -> Result<PluginIndex> {
    let data = match fs::read(index_path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Created new plugin index");
            return Ok(PluginIndex::new());
        }
        Err(e) => {
            return Err(MarketplaceError::Store(format!(
                "Failed to read {}: {}",
                index_path.display(),
                e
            )))
        }
    };

    let index: PluginIndex = serde_json::from_slice(&data).map_err(|e| {
        MarketplaceError::Corruption(format!("{}: {}", index_path.display(), e))
    })?;
    debug!("Loaded plugin index with {} plugins", index.plugins.len());
    Ok(index)
}

/// Read the index, setting a malformed file aside instead of failing
fn load_index(index_path: &Path) -> Result<PluginIndex> {
    match read_index_file(index_path) {
        Err(MarketplaceError::Corruption(reason)) => {
            let corrupt = corrupt_path(index_path);
            match fs::rename(index_path, &corrupt) {
                Ok(()) => warn!("Backed up corrupted index to {}", corrupt.display()),
                Err(rename_err) => warn!("Failed to back up corrupted index: {}", rename_err),
            }
            warn!("Corrupted plugin index ({}), starting with an empty one", reason);
            Ok(PluginIndex::new())
        }
        other => other,
    }
}

/// Write the index through a sibling temp file and rename it into place
fn save_index(base_path: &Path, index_path: &Path, index: &PluginIndex) -> Result<()> {
    let json = serde_json::to_vec_pretty(index)?;

    let mut tmp = tempfile::NamedTempFile::new_in(base_path)
        .map_err(|e| MarketplaceError::Store(format!("Failed to create temp index: {}", e)))?;
    tmp.write_all(&json)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| MarketplaceError::Store(format!("Failed to write index: {}", e)))?;
    tmp.persist(index_path).map_err(|e| {
        MarketplaceError::Store(format!(
            "Failed to save {}: {}",
            index_path.display(),
            e.error
        ))
    })?;

    debug!("Saved plugin index with {} plugins", index.plugins.len());
    Ok(())
}

fn corrupt_path(index_path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let mut name = index_path.as_os_str().to_owned();
    name.push(format!(".corrupt-{}", stamp));
    PathBuf::from(name)
}

/// Map a plugin ID to a safe directory name
///
/// The ID is cleaned lexically and only its last component is kept, so
/// separators and `..` can never escape the store directory.
pub fn sanitize_id(id: &str) -> String {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(id).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else {
                    parts.push(std::ffi::OsStr::new(".."));
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    match parts.last() {
        Some(last) if *last != ".." => last.to_string_lossy().into_owned(),
        _ => INVALID_ID_DIR.to_string(),
    }
}

/// Accept only a single plain file name
fn checked_filename(filename: &str) -> Result<&str> {
    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(filename),
        _ => Err(MarketplaceError::InvalidPlugin(format!(
            "invalid plugin file name: {}",
            filename
        ))),
    }
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
