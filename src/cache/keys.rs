//! Cache key definitions.
//!
//! Defines `CacheNamespace` for versioned buckets and `RequestFingerprint`
//! for the slot a request occupies inside one.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use super::network::Request;

/// An isolated, versioned bucket of cache entries.
///
/// The storage name `"{name}-{version_tag}"` is what hosts see; bumping the
/// version tag orphans the previous bucket so activation can delete it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheNamespace {
    pub name: String,
    pub version_tag: String,
}

impl CacheNamespace {
    pub fn new(name: impl Into<String>, version_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_tag: version_tag.into(),
        }
    }

    /// Name under which the namespace is persisted and reported.
    pub fn storage_name(&self) -> String {
        if self.version_tag.is_empty() {
            self.name.clone()
        } else {
            format!("{}-{}", self.name, self.version_tag)
        }
    }

    /// Hex SHA-256 of the name and version tag, used as a filesystem-safe
    /// directory name. Unlike `storage_name`, distinct namespaces never collide.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.version_tag.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns true if this namespace is another version of the same bucket.
    pub fn same_bucket(&self, other: &CacheNamespace) -> bool {
        self.name == other.name
    }
}

impl fmt::Display for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_name())
    }
}

/// Deterministic lookup key derived from a request.
///
/// Built from the method, the URL without its fragment and, when a rule asks
/// for it, the values of selected request headers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Fingerprint a request, folding in the listed headers (case-insensitive).
    pub fn from_request(request: &Request, vary_headers: &[String]) -> Self {
        let mut key = format!(
            "{} {}",
            request.method.as_str(),
            canonical_url(&request.url)
        );

        for name in vary_headers {
            let value = request.header(name).unwrap_or_default();
            key.push('|');
            key.push_str(&name.to_ascii_lowercase());
            key.push('=');
            key.push_str(value);
        }

        Self(key)
    }

    /// Fingerprint of a plain `GET` for `url`, as used by precaching and fallbacks.
    pub fn for_url(url: &Url) -> Self {
        Self(format!("GET {}", canonical_url(url)))
    }

    /// Wrap an already-canonical fingerprint string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex SHA-256 digest, used as a filesystem-safe entry name.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}
