//! Background refresh tracking.
//!
//! Collapses concurrent stale-while-revalidate refreshes so that only one
//! fetch per slot is in flight at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;

use super::keys::{CacheNamespace, RequestFingerprint};

#[derive(Debug, Default)]
struct Inner {
    in_flight: DashSet<String>,
    collapsed: AtomicU64,
}

/// Set of slots with a refresh currently running.
#[derive(Debug, Clone, Default)]
pub struct RevalidationTracker {
    inner: Arc<Inner>,
}

impl RevalidationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot; `None` if another refresh already holds it.
    ///
    /// The claim is released when the guard drops, whether the refresh
    /// succeeded, failed or panicked.
    pub fn try_start(
        &self,
        namespace: &CacheNamespace,
        fingerprint: &RequestFingerprint,
    ) -> Option<RevalidationGuard> {
        let key = format!("{}|{}", namespace.storage_name(), fingerprint);
        if self.inner.in_flight.insert(key.clone()) {
            Some(RevalidationGuard {
                inner: Arc::clone(&self.inner),
                key,
            })
        } else {
            self.inner.collapsed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn active(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Refreshes skipped because one was already running.
    pub fn collapsed(&self) -> u64 {
        self.inner.collapsed.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct RevalidationGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for RevalidationGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.key);
    }
}
