//! Staged activation of plugin directories
//!
//! A plugin is prepared in a staging directory next to the live one and then
//! swapped in with renames, so the live path always holds either the old
//! version or the new one in full.

use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{MarketplaceError, Result};

/// Move a prepared `stage` directory into `live`
///
/// An existing live directory is first renamed to `{live}.bak-<ts>`. If
/// moving the stage in fails, the backup is put back; if that fails too,
/// both errors are reported and the backup is left for manual recovery.
/// Returns the backup path, if one was made.
pub fn stage_install<F>(stage: &Path, live: &Path, mut rename: F) -> Result<Option<PathBuf>>
where
    F: FnMut(&Path, &Path) -> io::Result<()>,
{
    let has_live = match fs::metadata(live) {
        Ok(meta) if meta.is_dir() => true,
        Ok(_) => {
            return Err(MarketplaceError::Activation(format!(
                "live path is not a directory: {}",
                live.display()
            )))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            return Err(MarketplaceError::Activation(format!(
                "stat {}: {}",
                live.display(),
                e
            )))
        }
    };

    let backup = if has_live {
        let backup = timestamped(live, "bak");
        rename(live, &backup).map_err(|e| {
            MarketplaceError::Activation(format!("backup existing plugin: {}", e))
        })?;
        debug!("Backed up {} to {}", live.display(), backup.display());
        Some(backup)
    } else {
        None
    };

    if let Err(e) = rename(stage, live) {
        if let Some(backup) = &backup {
            if let Err(restore_err) = rename(backup, live) {
                return Err(MarketplaceError::Activation(format!(
                    "activate plugin failed: {}; restoring backup {} failed: {}",
                    e,
                    backup.display(),
                    restore_err
                )));
            }
        }
        return Err(MarketplaceError::Activation(format!(
            "activate plugin failed: {}",
            e
        )));
    }

    Ok(backup)
}

/// Undo an activation whose metadata could not be recorded
///
/// With a backup, the new directory is moved aside as `{live}.failed-<ts>`,
/// the backup restored and the failed copy deleted. Without one, the new
/// directory is simply removed.
pub fn rollback_install(live: &Path, backup: Option<&Path>) -> io::Result<()> {
    let Some(backup) = backup else {
        return remove_dir_if_exists(live);
    };

    let failed = timestamped(live, "failed");
    fs::rename(live, &failed)?;
    fs::rename(backup, live)?;
    remove_dir_if_exists(&failed)
}

/// Delete a backup once the new version is committed
pub fn discard_backup(backup: &Path) {
    if let Err(e) = remove_dir_if_exists(backup) {
        warn!("Failed to remove backup {}: {}", backup.display(), e);
    }
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn timestamped(live: &Path, tag: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let mut name = live.as_os_str().to_owned();
    name.push(format!(".{}-{}", tag, stamp));
    PathBuf::from(name)
}
