//! Manifest types published by plugin registries

use serde::{Deserialize, Serialize};

/// Wildcard value accepted in an artifact's `os` or `arch` field
pub const ANY_PLATFORM: &str = "any";

/// A registry's full plugin listing, as served from `{registry}/index.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryIndex {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub plugins: Vec<MarketplaceManifest>,
}

impl RegistryIndex {
    /// Find a plugin manifest by ID
    pub fn find(&self, id: &str) -> Option<&MarketplaceManifest> {
        self.plugins.iter().find(|p| p.id == id)
    }
}

/// Registry-published description of one plugin version
///
/// A manifest is immutable once fetched: a new version of a plugin is a new
/// manifest object. The optional `signature` covers the JSON serialisation
/// of the manifest with the signature field itself omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceManifest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<PluginArtifact>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl MarketplaceManifest {
    /// Parse manifest from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize manifest to pretty JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Serialize the manifest without its signature (the signed payload)
    ///
    /// The bytes depend on the field order of this struct, so a registry
    /// signing manifests must serialise them the same way.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        serde_json::to_vec(&unsigned)
    }

    /// True if the manifest ships no binaries (source-only plugin)
    pub fn is_source_only(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// One OS/arch-specific downloadable build of a plugin version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginArtifact {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl PluginArtifact {
    /// Check whether this artifact runs on the given OS/arch
    ///
    /// Each field matches when equal or when the artifact declares `"any"`.
    pub fn matches_platform(&self, os: &str, arch: &str) -> bool {
        let os_match = self.os == os || self.os == ANY_PLATFORM;
        let arch_match = self.arch == arch || self.arch == ANY_PLATFORM;
        os_match && arch_match
    }

    /// Resolve the archive format: declared format first, then URL suffix
    ///
    /// Returns `None` when the format is unknown or unsupported.
    pub fn resolved_format(&self) -> Option<ArtifactFormat> {
        if self.format.is_empty() {
            ArtifactFormat::detect(&self.url)
        } else {
            ArtifactFormat::parse(&self.format)
        }
    }

    /// Human-readable format label for error messages
    pub fn format_label(&self) -> &str {
        if self.format.is_empty() {
            &self.url
        } else {
            &self.format
        }
    }
}

/// Supported artifact packaging formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// Gzip-compressed tarball
    TarGz,
    /// Zip archive
    Zip,
    /// A bare shared object, stored as `plugin.so`
    Raw,
}

impl ArtifactFormat {
    /// Parse a declared format name
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tar.gz" | "tgz" => Some(Self::TarGz),
            "zip" => Some(Self::Zip),
            "so" => Some(Self::Raw),
            _ => None,
        }
    }

    /// Infer the format from a download URL suffix
    pub fn detect(url: &str) -> Option<Self> {
        let url = url.to_ascii_lowercase();
        if url.ends_with(".tar.gz") || url.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if url.ends_with(".zip") {
            Some(Self::Zip)
        } else if url.ends_with(".so") {
            Some(Self::Raw)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactFormat::TarGz => write!(f, "tar.gz"),
            ArtifactFormat::Zip => write!(f, "zip"),
            ArtifactFormat::Raw => write!(f, "so"),
        }
    }
}
