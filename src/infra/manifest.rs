//! Precache manifest files.
//!
//! ```toml
//! [[entries]]
//! url = "/index.html"
//! revision = "3f2a9c"
//!
//! [[entries]]
//! url = "https://cdn.example.com/app.css"
//! namespace = "cdn-styles"
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::cache::{CacheConfig, ManifestEntry, PrecacheManifest};

use super::error::InfraError;

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    entries: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    url: String,
    #[serde(default)]
    revision: Option<String>,
    /// Bucket name; versioned with `cache.version`.
    #[serde(default)]
    namespace: Option<String>,
}

/// Read and resolve the manifest named by `cache.manifest`, if any.
pub async fn load(cache: &CacheConfig) -> Result<PrecacheManifest, InfraError> {
    let Some(path) = cache.manifest.as_deref() else {
        return Ok(PrecacheManifest::default());
    };
    let manifest = read(path, cache).await?;
    info!(
        path = %path.display(),
        entries = manifest.entries.len(),
        "Loaded precache manifest"
    );
    Ok(manifest)
}

pub async fn read(path: &Path, cache: &CacheConfig) -> Result<PrecacheManifest, InfraError> {
    let raw = tokio::fs::read_to_string(path).await?;
    parse(&raw, cache)
}

pub fn parse(raw: &str, cache: &CacheConfig) -> Result<PrecacheManifest, InfraError> {
    let parsed: RawManifest = toml::from_str(raw)
        .map_err(|err| InfraError::configuration(format!("invalid manifest: {err}")))?;

    let entries = parsed
        .entries
        .into_iter()
        .map(|entry| {
            let url = cache
                .resolve_url(&entry.url)
                .map_err(|reason| InfraError::configuration(format!("manifest: {reason}")))?;
            let mut resolved = ManifestEntry::new(url);
            if let Some(revision) = entry.revision {
                resolved = resolved.with_revision(revision);
            }
            if let Some(name) = entry.namespace {
                let namespace = cache
                    .checked_namespace(&name)
                    .map_err(|reason| InfraError::configuration(format!("manifest: {reason}")))?;
                resolved = resolved.in_namespace(namespace);
            }
            Ok(resolved)
        })
        .collect::<Result<Vec<_>, InfraError>>()?;

    Ok(PrecacheManifest::new(entries))
}
