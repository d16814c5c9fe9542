//! Registry client for fetching plugin indexes over HTTP
//!
//! Each registry serves `GET {registry}/index.json`. Indexes are cached per
//! registry URL for a configurable TTL. Aggregate operations fetch every
//! configured registry concurrently and treat a single failing registry as a
//! warning, not an error; results always come back in configured order, so
//! "first registry wins" is deterministic.

use futures::future::join_all;
use pluginsdk::{
    MarketplaceManifest, PluginArtifact, PluginSearchResult, RegistryIndex, ANY_PLATFORM,
};
use reqwest::header::ACCEPT;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{MarketplaceError, Result};

/// Registry used when nothing else is configured
pub const DEFAULT_REGISTRY_URL: &str = "https://plugins.nexus.dev";

/// User agent sent with every request
pub const USER_AGENT: &str = "nexus-marketplace/1.0";

/// How long a fetched index is served from cache
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Hard ceiling on downloaded artifact size (100 MiB)
pub const MAX_ARTIFACT_SIZE: usize = 100 * 1024 * 1024;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_LIMIT: usize = 1024;
const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Filters applied by [`RegistryClient::search`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Keep only plugins listing this category (case-insensitive)
    pub category: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    /// Maximum number of results, 0 for no limit
    pub limit: usize,
}

impl SearchOptions {
    /// Filter to the running platform with the default limit
    pub fn for_current_platform() -> Self {
        Self {
            category: None,
            os: Some(current_os().to_string()),
            arch: Some(current_arch().to_string()),
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

struct CachedIndex {
    index: Arc<RegistryIndex>,
    fetched_at: Instant,
}

/// HTTP client for plugin registries
pub struct RegistryClient {
    registries: RwLock<Vec<String>>,
    http: reqwest::Client,
    cache: RwLock<HashMap<String, CachedIndex>>,
    cache_ttl: Duration,
    max_artifact_size: usize,
}

impl RegistryClient {
    /// Create a client for the given registries
    pub fn new(registries: Vec<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self::with_http_client(registries, http))
    }

    /// Create a client around an existing `reqwest::Client`
    pub fn with_http_client(registries: Vec<String>, http: reqwest::Client) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(registries.len());
        for url in registries {
            if !unique.contains(&url) {
                unique.push(url);
            }
        }

        Self {
            registries: RwLock::new(unique),
            http,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: DEFAULT_CACHE_TTL,
            max_artifact_size: MAX_ARTIFACT_SIZE,
        }
    }

    /// Override the index cache TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Lower the artifact size ceiling; never raises it above [`MAX_ARTIFACT_SIZE`]
    pub fn with_max_artifact_size(mut self, limit: usize) -> Self {
        self.max_artifact_size = limit.min(MAX_ARTIFACT_SIZE);
        self
    }

    /// Configured registry URLs, in order
    pub fn registries(&self) -> Vec<String> {
        self.registries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Append a registry if not already present
    pub fn add_registry(&self, url: &str) {
        let mut registries = self
            .registries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !registries.iter().any(|r| r == url) {
            registries.push(url.to_string());
        }
    }

    /// Drop every cached index
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Fetch one registry's index, serving from cache while fresh
    pub async fn fetch_index(&self, registry_url: &str) -> Result<Arc<RegistryIndex>> {
        if let Some(index) = self.cached(registry_url) {
            debug!("Using cached registry index for {}", registry_url);
            return Ok(index);
        }

        let index_url = format!("{}/index.json", registry_url.trim_end_matches('/'));
        debug!("Fetching registry index: {}", index_url);

        let mut response = self
            .http
            .get(&index_url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let (body, _) = read_capped(&mut response, ERROR_BODY_LIMIT).await?;
            return Err(MarketplaceError::RegistryStatus {
                url: index_url,
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let index: RegistryIndex = response.json().await?;
        let index = Arc::new(index);

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                registry_url.to_string(),
                CachedIndex {
                    index: Arc::clone(&index),
                    fetched_at: Instant::now(),
                },
            );

        info!(
            "Fetched registry index from {} ({} plugins)",
            registry_url,
            index.plugins.len()
        );
        Ok(index)
    }

    /// Fetch every configured registry concurrently
    ///
    /// Failed registries are logged and left out. An error is returned only
    /// when every registry failed.
    pub async fn fetch_all_indexes(&self) -> Result<Vec<(String, Arc<RegistryIndex>)>> {
        let registries = self.registries();
        let fetches = registries.iter().map(|url| self.fetch_index(url));
        let outcomes = join_all(fetches).await;

        let mut indexes = Vec::with_capacity(registries.len());
        let mut errors = Vec::new();
        for (url, outcome) in registries.into_iter().zip(outcomes) {
            match outcome {
                Ok(index) => indexes.push((url, index)),
                Err(e) => {
                    warn!("Failed to fetch registry {}: {}", url, e);
                    errors.push(format!("{}: {}", url, e));
                }
            }
        }

        if indexes.is_empty() && !errors.is_empty() {
            return Err(MarketplaceError::AllRegistriesFailed(errors));
        }
        Ok(indexes)
    }

    /// Find a plugin by ID, returning its manifest and owning registry URL
    pub async fn get_plugin(&self, id: &str) -> Result<(MarketplaceManifest, String)> {
        let indexes = self.fetch_all_indexes().await?;

        indexes
            .iter()
            .find_map(|(url, index)| index.find(id).map(|m| (m.clone(), url.clone())))
            .ok_or_else(|| MarketplaceError::PluginNotFound(id.to_string()))
    }

    /// Search all registries
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<PluginSearchResult>> {
        let indexes = self.fetch_all_indexes().await?;
        Ok(rank_plugins(indexes.iter().map(|(_, i)| i.as_ref()), query, opts))
    }

    /// Download an artifact, refusing anything over the size ceiling
    ///
    /// The ceiling is [`MAX_ARTIFACT_SIZE`] unless lowered with
    /// [`RegistryClient::with_max_artifact_size`]. A declared `Content-Length`
    /// over it fails before the body is read; otherwise the body is read up to
    /// the ceiling and rejected if more follows.
    pub async fn download_artifact(&self, artifact: &PluginArtifact) -> Result<Vec<u8>> {
        if artifact.url.is_empty() {
            return Err(MarketplaceError::InvalidPlugin(
                "artifact has no download URL".to_string(),
            ));
        }

        debug!("Downloading artifact: {}", artifact.url);
        let mut response = self.http.get(&artifact.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let (body, _) = read_capped(&mut response, ERROR_BODY_LIMIT).await?;
            return Err(MarketplaceError::RegistryStatus {
                url: artifact.url.clone(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_artifact_size as u64)
        {
            return Err(too_large(&artifact.url, self.max_artifact_size));
        }

        let (data, truncated) = read_capped(&mut response, self.max_artifact_size).await?;
        if truncated {
            return Err(too_large(&artifact.url, self.max_artifact_size));
        }

        info!("Downloaded artifact {} ({} bytes)", artifact.url, data.len());
        Ok(data)
    }

    fn cached(&self, registry_url: &str) -> Option<Arc<RegistryIndex>> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(registry_url)
            .filter(|c| c.fetched_at.elapsed() < self.cache_ttl)
            .map(|c| Arc::clone(&c.index))
    }
}

fn too_large(url: &str, limit: usize) -> MarketplaceError {
    MarketplaceError::Network(format!(
        "artifact {} exceeds the {} byte size limit",
        url, limit
    ))
}

/// Read at most `cap` bytes of a response body
///
/// Returns the bytes and whether the body was longer than `cap`.
async fn read_capped(response: &mut reqwest::Response, cap: usize) -> Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = cap - buf.len();
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            return Ok((buf, true));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok((buf, false))
}

/// Dedupe, filter, score and sort manifests from several indexes
///
/// Indexes are consumed in order, so the first index listing an ID wins.
pub fn rank_plugins<'a>(
    indexes: impl IntoIterator<Item = &'a RegistryIndex>,
    query: &str,
    opts: &SearchOptions,
) -> Vec<PluginSearchResult> {
    let query_lower = query.to_lowercase();
    let mut seen = HashSet::new();
    let mut results = Vec::new();

    for index in indexes {
        for plugin in &index.plugins {
            if !seen.insert(plugin.id.as_str()) {
                continue;
            }

            if let Some(category) = opts.category.as_deref().filter(|c| !c.is_empty()) {
                let listed = plugin
                    .categories
                    .iter()
                    .any(|c| c.to_lowercase() == category.to_lowercase());
                if !listed {
                    continue;
                }
            }

            if !is_compatible(plugin, opts.os.as_deref(), opts.arch.as_deref()) {
                continue;
            }

            let score = calculate_score(plugin, &query_lower);
            if score == 0.0 && !query.is_empty() {
                continue;
            }

            results.push(PluginSearchResult::new(plugin.clone(), score));
        }
    }

    // Stable, so ties keep registry order
    results.sort_by(|a, b| b.score.total_cmp(&a.score));

    if opts.limit > 0 {
        results.truncate(opts.limit);
    }
    results
}

/// Whether any artifact runs on the given platform
///
/// Source-only plugins (no artifacts) are always compatible. A `None`
/// OS or arch matches anything.
pub fn is_compatible(plugin: &MarketplaceManifest, os: Option<&str>, arch: Option<&str>) -> bool {
    if plugin.is_source_only() {
        return true;
    }

    plugin.artifacts.iter().any(|a| {
        let os_match = os.map_or(true, |os| a.os == os || a.os == ANY_PLATFORM);
        let arch_match = arch.map_or(true, |arch| a.arch == arch || a.arch == ANY_PLATFORM);
        os_match && arch_match
    })
}

/// Weighted relevance of a manifest for an already-lowercased query
pub fn calculate_score(plugin: &MarketplaceManifest, query_lower: &str) -> f64 {
    if query_lower.is_empty() {
        return 1.0;
    }

    let mut score = 0.0;

    let id = plugin.id.to_lowercase();
    if id.contains(query_lower) {
        score += 0.4;
        if id == query_lower {
            score += 0.3;
        }
    }

    if plugin.name.to_lowercase().contains(query_lower) {
        score += 0.3;
    }

    if plugin.description.to_lowercase().contains(query_lower) {
        score += 0.1;
    }

    if plugin
        .keywords
        .iter()
        .any(|k| k.to_lowercase().contains(query_lower))
    {
        score += 0.1;
    }

    if plugin
        .categories
        .iter()
        .any(|c| c.to_lowercase().contains(query_lower))
    {
        score += 0.1;
    }

    score
}

/// First artifact in manifest order that runs on `os`/`arch`
pub fn artifact_for_os<'a>(
    manifest: &'a MarketplaceManifest,
    os: &str,
    arch: &str,
) -> Option<&'a PluginArtifact> {
    manifest.artifacts.iter().find(|a| a.matches_platform(os, arch))
}

/// First artifact that runs on the current platform
pub fn artifact_for_platform(manifest: &MarketplaceManifest) -> Option<&PluginArtifact> {
    artifact_for_os(manifest, current_os(), current_arch())
}

/// Current OS in registry naming (`linux`, `darwin`, `windows`, ...)
pub fn current_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Current CPU architecture in registry naming (`amd64`, `arm64`, `386`, ...)
pub fn current_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}
