//! Validity filter applied before any write.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::store::{CachedResponse, ResponseKind};

const DEFAULT_STATUSES: [u16; 1] = [200];

/// Which responses may be written to a namespace.
///
/// `kinds: None` admits every kind except `Error`, which is never cacheable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheablePolicy {
    pub statuses: BTreeSet<u16>,
    pub kinds: Option<BTreeSet<ResponseKind>>,
}

impl Default for CacheablePolicy {
    fn default() -> Self {
        Self {
            statuses: BTreeSet::from(DEFAULT_STATUSES),
            kinds: None,
        }
    }
}

impl CacheablePolicy {
    pub fn statuses(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            kinds: None,
        }
    }

    /// Also admit opaque cross-origin responses, which report status 0.
    pub fn with_opaque(mut self) -> Self {
        self.statuses.insert(0);
        self
    }

    pub fn only_kinds(mut self, kinds: impl IntoIterator<Item = ResponseKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn allows(&self, response: &CachedResponse) -> bool {
        if response.kind == ResponseKind::Error {
            return false;
        }
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&response.kind)
        {
            return false;
        }
        self.statuses.contains(&response.status)
    }
}
