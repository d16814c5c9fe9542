//! Artifact extraction
//!
//! Tarballs and zip archives are both reduced to a stream of
//! [`ArchiveEntry`] values and fed through one [`EntrySink`], which owns the
//! traversal checks and binary detection. Only directories and regular files
//! are materialised; symlinks, devices and other special entries are skipped.

use flate2::read::GzDecoder;
use pluginsdk::{ArtifactFormat, PluginArtifact, DEFAULT_BINARY_FILENAME};
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{MarketplaceError, Result};
use crate::store::set_mode;

const DEFAULT_FILE_MODE: u32 = 0o644;
const BINARY_FILE_MODE: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Other,
}

/// One archive member, independent of the container format
pub struct ArchiveEntry<'a> {
    pub name: String,
    pub mode: Option<u32>,
    pub kind: EntryKind,
    pub reader: &'a mut dyn Read,
}

/// Writes archive entries under a root directory
pub struct EntrySink<'a> {
    root: &'a Path,
    binary: Option<PathBuf>,
}

impl<'a> EntrySink<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { root, binary: None }
    }

    /// Materialise one entry
    ///
    /// Entries that resolve outside the root are skipped. The first regular
    /// file whose name ends in `.so` is remembered as the plugin binary.
    pub fn accept(&mut self, entry: ArchiveEntry<'_>) -> Result<()> {
        let Some(target) = sanitize_entry_path(self.root, &entry.name) else {
            warn!("Skipping archive entry outside staging dir: {}", entry.name);
            return Ok(());
        };

        match entry.kind {
            EntryKind::Dir => {
                fs::create_dir_all(&target).map_err(|e| io_error("create directory", &target, e))?;
            }
            EntryKind::File => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| io_error("create directory", parent, e))?;
                }

                let mut file = fs::File::create(&target).map_err(|e| io_error("create", &target, e))?;
                io::copy(entry.reader, &mut file).map_err(|e| io_error("write", &target, e))?;

                let mode = entry
                    .mode
                    .map(|m| m & 0o777)
                    .filter(|m| *m != 0)
                    .unwrap_or(DEFAULT_FILE_MODE);
                set_mode(&target, mode).map_err(|e| io_error("chmod", &target, e))?;

                if self.binary.is_none() && entry.name.ends_with(".so") {
                    debug!("Found plugin binary: {}", entry.name);
                    self.binary = Some(target);
                }
            }
            EntryKind::Other => {
                debug!("Skipping special archive entry: {}", entry.name);
            }
        }

        Ok(())
    }

    /// Return the binary path, falling back to a root-level `plugin.so`
    pub fn finish(self) -> Result<PathBuf> {
        if let Some(binary) = self.binary {
            return Ok(binary);
        }

        let fallback = self.root.join(DEFAULT_BINARY_FILENAME);
        if fallback.is_file() {
            return Ok(fallback);
        }

        Err(MarketplaceError::Extraction(format!(
            "no plugin binary (.so) found in archive and no {} at its root",
            DEFAULT_BINARY_FILENAME
        )))
    }
}

/// Extract an artifact into `dest` and return the binary path
///
/// Blocking; run it off the async runtime.
pub fn extract_artifact(data: &[u8], artifact: &PluginArtifact, dest: &Path) -> Result<PathBuf> {
    let format = artifact.resolved_format().ok_or_else(|| {
        MarketplaceError::Extraction(format!(
            "unsupported artifact format: {}",
            artifact.format_label()
        ))
    })?;

    fs::create_dir_all(dest).map_err(|e| io_error("create directory", dest, e))?;
    debug!("Extracting {} artifact into {}", format, dest.display());

    let mut sink = EntrySink::new(dest);
    match format {
        ArtifactFormat::TarGz => decode_tar_gz(data, &mut sink)?,
        ArtifactFormat::Zip => decode_zip(data, &mut sink)?,
        ArtifactFormat::Raw => {
            let binary = dest.join(DEFAULT_BINARY_FILENAME);
            fs::write(&binary, data).map_err(|e| io_error("write", &binary, e))?;
            set_mode(&binary, BINARY_FILE_MODE).map_err(|e| io_error("chmod", &binary, e))?;
            return Ok(binary);
        }
    }

    sink.finish()
}

fn decode_tar_gz(data: &[u8], sink: &mut EntrySink<'_>) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(data)));
    let entries = archive.entries().map_err(archive_error)?;

    for entry in entries {
        let mut entry = entry.map_err(archive_error)?;
        let name = entry.path().map_err(archive_error)?.to_string_lossy().into_owned();
        let mode = entry.header().mode().ok();
        let entry_type = entry.header().entry_type();
        let kind = if entry_type.is_dir() {
            EntryKind::Dir
        } else if entry_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        sink.accept(ArchiveEntry {
            name,
            mode,
            kind,
            reader: &mut entry,
        })?;
    }

    Ok(())
}

fn decode_zip(data: &[u8], sink: &mut EntrySink<'_>) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).map_err(archive_error)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(archive_error)?;
        let name = file.name().to_string();
        let mode = file.unix_mode();
        let kind = if file.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        sink.accept(ArchiveEntry {
            name,
            mode,
            kind,
            reader: &mut file,
        })?;
    }

    Ok(())
}

/// Resolve an archive entry name under `root`
///
/// Absolute names are rebased under the root. `None` means the entry
/// escapes the root or names the root itself.
pub fn sanitize_entry_path(root: &Path, name: &str) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    if parts.is_empty() {
        return None;
    }

    let mut target = root.to_path_buf();
    target.extend(parts);
    Some(target)
}

fn archive_error(e: impl std::fmt::Display) -> MarketplaceError {
    MarketplaceError::Extraction(format!("malformed archive: {}", e))
}

fn io_error(action: &str, path: &Path, e: io::Error) -> MarketplaceError {
    MarketplaceError::Extraction(format!("{} {}: {}", action, path.display(), e))
}
