//! Per-namespace capacity and age limits.
//!
//! Enforcement runs after every successful write and never fails it: a
//! namespace may be briefly over its limit, a write is never lost.

use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::keys::CacheNamespace;
use super::store::{CacheEntry, CacheStore, EntryStamp};

const METRIC_CACHE_EVICT: &str = "stowaway_cache_evict_total";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationPolicy {
    pub max_entries: Option<usize>,
    pub max_age_seconds: Option<u64>,
}

/// Entries chosen for eviction, split by reason.
///
/// Each stamp names the exact write that was planned against, so an entry
/// rewritten after planning is left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub expired: Vec<EntryStamp>,
    pub overflow: Vec<EntryStamp>,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.overflow.is_empty()
    }
}

/// What an enforcement pass actually removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub expired: usize,
    pub overflow: usize,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.expired + self.overflow
    }
}

impl ExpirationPolicy {
    pub fn new(max_entries: Option<usize>, max_age_seconds: Option<u64>) -> Self {
        Self {
            max_entries,
            max_age_seconds,
        }
    }

    pub fn max_entries(limit: usize) -> Self {
        Self::new(Some(limit), None)
    }

    pub fn max_age(seconds: u64) -> Self {
        Self::new(None, Some(seconds))
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_entries.is_none() && self.max_age_seconds.is_none()
    }

    fn is_expired(&self, stored_at: OffsetDateTime, now: OffsetDateTime) -> bool {
        let Some(max_age) = self.max_age_seconds else {
            return false;
        };
        let age: Duration = (now - stored_at).try_into().unwrap_or(Duration::ZERO);
        age > Duration::from_secs(max_age)
    }

    /// Whether a cached entry may still be served at `now`.
    pub fn is_fresh(&self, entry: &CacheEntry, now: OffsetDateTime) -> bool {
        !self.is_expired(entry.stored_at, now)
    }

    /// Decide what to evict from `log`; pure.
    ///
    /// Ages past the limit go first, then the oldest `stored_at` entries
    /// (ties by insertion sequence) until the count fits.
    pub fn plan(&self, log: &[EntryStamp], now: OffsetDateTime) -> EvictionPlan {
        let mut plan = EvictionPlan::default();
        let mut survivors: Vec<&EntryStamp> = Vec::with_capacity(log.len());

        for stamp in log {
            if self.is_expired(stamp.stored_at, now) {
                plan.expired.push(stamp.clone());
            } else {
                survivors.push(stamp);
            }
        }

        if let Some(limit) = self.max_entries
            && survivors.len() > limit
        {
            survivors.sort_by_key(|stamp| (stamp.stored_at, stamp.sequence));
            let excess = survivors.len() - limit;
            plan.overflow = survivors
                .into_iter()
                .take(excess)
                .cloned()
                .collect();
        }

        plan
    }

    /// Apply the policy to one namespace; errors are logged, not returned.
    pub async fn enforce(
        &self,
        store: &dyn CacheStore,
        namespace: &CacheNamespace,
        now: OffsetDateTime,
    ) -> EvictionReport {
        if self.is_unbounded() {
            return EvictionReport::default();
        }

        let log = match store.entry_log(namespace).await {
            Ok(log) => log,
            Err(err) => {
                warn!(namespace = %namespace, error = %err, "Skipping expiration, entry log unavailable");
                return EvictionReport::default();
            }
        };

        let plan = self.plan(&log, now);
        if plan.is_empty() {
            return EvictionReport::default();
        }

        let report = EvictionReport {
            expired: evict(store, namespace, &plan.expired, "expired").await,
            overflow: evict(store, namespace, &plan.overflow, "overflow").await,
        };

        debug!(
            namespace = %namespace,
            expired = report.expired,
            overflow = report.overflow,
            "Evicted cache entries"
        );

        report
    }
}

async fn evict(
    store: &dyn CacheStore,
    namespace: &CacheNamespace,
    stamps: &[EntryStamp],
    reason: &'static str,
) -> usize {
    let mut removed = 0;
    for stamp in stamps {
        match store.remove_if_unchanged(namespace, stamp).await {
            Ok(true) => removed += 1,
            Ok(false) => {
                debug!(fingerprint = %stamp.fingerprint, "Entry changed since planning, kept");
            }
            Err(err) => {
                warn!(
                    namespace = %namespace,
                    fingerprint = %stamp.fingerprint,
                    error = %err,
                    "Failed to evict cache entry"
                );
            }
        }
    }
    if removed > 0 {
        counter!(METRIC_CACHE_EVICT, "reason" => reason).increment(removed as u64);
    }
    removed
}
