use thiserror::Error;

use super::network::FetchError;
use super::store::StoreError;

/// Engine-level failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("network unavailable for `{url}`: {source}")]
    NetworkUnavailable {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("response for `{fingerprint}` is not cacheable (status {status})")]
    EntryNotCacheable { fingerprint: String, status: u16 },
    #[error("cache namespace `{0}` does not exist")]
    NamespaceNotFound(String),
    #[error("install failed: {reason}")]
    InstallFailed {
        reason: String,
        #[source]
        source: Option<Box<CacheError>>,
    },
}

impl CacheError {
    pub fn network(url: &url::Url, source: FetchError) -> Self {
        Self::NetworkUnavailable {
            url: url.to_string(),
            source,
        }
    }

    pub fn install(reason: impl Into<String>, source: Option<CacheError>) -> Self {
        Self::InstallFailed {
            reason: reason.into(),
            source: source.map(Box::new),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::NetworkUnavailable { .. })
    }
}
