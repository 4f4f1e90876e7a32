//! Cache storage.
//!
//! `CacheStore` is the persistence seam: namespace -> (fingerprint -> entry).
//! `MemoryStore` keeps everything in process; see `disk.rs` for the durable
//! backend.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use super::keys::{CacheNamespace, RequestFingerprint};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

// ============================================================================
// Entries
// ============================================================================

/// Response classification, mirroring fetch response types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response with readable status and body.
    Cors,
    /// Cross-origin response with hidden status (reported as 0).
    Opaque,
    /// Network-level error masquerading as a response.
    Error,
}

/// Cached HTTP response.
///
/// The body is immutable `Bytes`, so every clone is an independent copy as
/// far as callers are concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub kind: ResponseKind,
}

impl CachedResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            kind: ResponseKind::Basic,
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_kind(mut self, kind: ResponseKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A response stored under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub namespace: CacheNamespace,
    pub fingerprint: RequestFingerprint,
    pub response: CachedResponse,
    pub stored_at: OffsetDateTime,
    /// Precache revision the entry was installed for, if any.
    pub revision: Option<String>,
}

impl CacheEntry {
    pub fn new(
        namespace: CacheNamespace,
        fingerprint: RequestFingerprint,
        response: CachedResponse,
        stored_at: OffsetDateTime,
    ) -> Self {
        Self {
            namespace,
            fingerprint,
            response,
            stored_at,
            revision: None,
        }
    }

    pub fn with_revision(mut self, revision: Option<String>) -> Self {
        self.revision = revision;
        self
    }

    /// Age at `now`; entries stamped in the future count as zero age.
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        (now - self.stored_at).try_into().unwrap_or(Duration::ZERO)
    }
}

/// Expiration bookkeeping for one slot, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStamp {
    pub fingerprint: RequestFingerprint,
    pub stored_at: OffsetDateTime,
    /// Monotonic insertion sequence; upserts take a fresh one.
    pub sequence: u64,
}

// ============================================================================
// Store trait
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt entry at `{path}`: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }
}

/// Key/value persistence for cache namespaces.
///
/// Implementations must make `put` atomic per slot: a concurrent `get`
/// observes either the previous or the new entry. Operations on one
/// namespace must not block another.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Upsert `entry` into its namespace, creating the namespace on first write.
    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError>;

    async fn get(
        &self,
        namespace: &CacheNamespace,
        fingerprint: &RequestFingerprint,
    ) -> Result<Option<CacheEntry>, StoreError>;

    /// Remove a whole namespace. Returns whether it existed.
    async fn delete(&self, namespace: &CacheNamespace) -> Result<bool, StoreError>;

    /// Remove one entry. Returns whether it existed.
    async fn remove(
        &self,
        namespace: &CacheNamespace,
        fingerprint: &RequestFingerprint,
    ) -> Result<bool, StoreError>;

    /// Remove the entry only if it is still the write described by `stamp`.
    ///
    /// Returns false when the slot is gone or has been rewritten since the
    /// stamp was taken.
    async fn remove_if_unchanged(
        &self,
        namespace: &CacheNamespace,
        stamp: &EntryStamp,
    ) -> Result<bool, StoreError>;

    async fn list_namespaces(&self) -> Result<BTreeSet<CacheNamespace>, StoreError>;

    /// Fingerprints in insertion order (oldest first).
    async fn keys(&self, namespace: &CacheNamespace)
    -> Result<Vec<RequestFingerprint>, StoreError>;

    /// Timestamps of every entry, in insertion order.
    async fn entry_log(&self, namespace: &CacheNamespace) -> Result<Vec<EntryStamp>, StoreError>;

    async fn has_namespace(&self, namespace: &CacheNamespace) -> Result<bool, StoreError> {
        Ok(self.list_namespaces().await?.contains(namespace))
    }
}

// ============================================================================
// Memory store
// ============================================================================

struct Slot {
    entry: CacheEntry,
    sequence: u64,
}

/// One namespace: an unbounded LRU used purely as an insertion-ordered map.
/// Reads go through `peek`, so only writes reorder it.
type Bucket = Arc<RwLock<LruCache<RequestFingerprint, Slot>>>;

/// In-process cache store.
pub struct MemoryStore {
    namespaces: RwLock<HashMap<CacheNamespace, Bucket>>,
    sequence: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    fn bucket(&self, namespace: &CacheNamespace) -> Option<Bucket> {
        rw_read(&self.namespaces, SOURCE, "bucket")
            .get(namespace)
            .cloned()
    }

    fn bucket_or_create(&self, namespace: &CacheNamespace) -> Bucket {
        if let Some(bucket) = self.bucket(namespace) {
            return bucket;
        }
        rw_write(&self.namespaces, SOURCE, "bucket_or_create")
            .entry(namespace.clone())
            .or_insert_with(|| Arc::new(RwLock::new(LruCache::unbounded())))
            .clone()
    }

    /// Number of entries across all namespaces.
    pub fn len(&self) -> usize {
        let buckets: Vec<Bucket> = rw_read(&self.namespaces, SOURCE, "len")
            .values()
            .cloned()
            .collect();
        buckets
            .iter()
            .map(|bucket| rw_read(bucket, SOURCE, "len.bucket").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let bucket = self.bucket_or_create(&entry.namespace);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let fingerprint = entry.fingerprint.clone();
        rw_write(&bucket, SOURCE, "put").push(fingerprint, Slot { entry, sequence });
        Ok(())
    }

    async fn get(
        &self,
        namespace: &CacheNamespace,
        fingerprint: &RequestFingerprint,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let Some(bucket) = self.bucket(namespace) else {
            return Ok(None);
        };
        let found = rw_read(&bucket, SOURCE, "get")
            .peek(fingerprint)
            .map(|slot| slot.entry.clone());
        Ok(found)
    }

    async fn delete(&self, namespace: &CacheNamespace) -> Result<bool, StoreError> {
        Ok(rw_write(&self.namespaces, SOURCE, "delete")
            .remove(namespace)
            .is_some())
    }

    async fn remove(
        &self,
        namespace: &CacheNamespace,
        fingerprint: &RequestFingerprint,
    ) -> Result<bool, StoreError> {
        let Some(bucket) = self.bucket(namespace) else {
            return Ok(false);
        };
        Ok(rw_write(&bucket, SOURCE, "remove").pop(fingerprint).is_some())
    }

    async fn remove_if_unchanged(
        &self,
        namespace: &CacheNamespace,
        stamp: &EntryStamp,
    ) -> Result<bool, StoreError> {
        let Some(bucket) = self.bucket(namespace) else {
            return Ok(false);
        };
        let mut slots = rw_write(&bucket, SOURCE, "remove_if_unchanged");
        let unchanged = slots
            .peek(&stamp.fingerprint)
            .is_some_and(|slot| slot.sequence == stamp.sequence);
        if unchanged {
            slots.pop(&stamp.fingerprint);
        }
        Ok(unchanged)
    }

    async fn list_namespaces(&self) -> Result<BTreeSet<CacheNamespace>, StoreError> {
        Ok(rw_read(&self.namespaces, SOURCE, "list_namespaces")
            .keys()
            .cloned()
            .collect())
    }

    async fn keys(
        &self,
        namespace: &CacheNamespace,
    ) -> Result<Vec<RequestFingerprint>, StoreError> {
        Ok(self
            .entry_log(namespace)
            .await?
            .into_iter()
            .map(|stamp| stamp.fingerprint)
            .collect())
    }

    async fn entry_log(&self, namespace: &CacheNamespace) -> Result<Vec<EntryStamp>, StoreError> {
        let Some(bucket) = self.bucket(namespace) else {
            return Ok(Vec::new());
        };
        // LRU iteration runs newest-first.
        let mut log: Vec<EntryStamp> = rw_read(&bucket, SOURCE, "entry_log")
            .iter()
            .map(|(fingerprint, slot)| EntryStamp {
                fingerprint: fingerprint.clone(),
                stored_at: slot.entry.stored_at,
                sequence: slot.sequence,
            })
            .collect();
        log.reverse();
        Ok(log)
    }

    async fn has_namespace(&self, namespace: &CacheNamespace) -> Result<bool, StoreError> {
        Ok(self.bucket(namespace).is_some())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Memory store with switchable failures.
    #[derive(Default)]
    pub(crate) struct FaultyStore {
        pub(crate) inner: MemoryStore,
        /// Puts whose fingerprint ends with this suffix fail; `""` refuses all.
        refuse_puts: Option<&'static str>,
        fail_bookkeeping: bool,
        write_after_log: Mutex<Option<CacheEntry>>,
    }

    impl FaultyStore {
        pub(crate) fn refusing_puts_to(suffix: &'static str) -> Self {
            Self {
                refuse_puts: Some(suffix),
                ..Self::default()
            }
        }

        pub(crate) fn refusing_all_puts() -> Self {
            Self::refusing_puts_to("")
        }

        /// `keys`, `entry_log` and single-entry removals fail.
        pub(crate) fn failing_bookkeeping() -> Self {
            Self {
                fail_bookkeeping: true,
                ..Self::default()
            }
        }

        /// Upsert `entry` right after the next `entry_log` snapshot is taken.
        pub(crate) fn write_after_next_log(self, entry: CacheEntry) -> Self {
            *self.write_after_log.lock().unwrap() = Some(entry);
            self
        }

        fn bookkeeping(&self) -> Result<(), StoreError> {
            if self.fail_bookkeeping {
                return Err(StoreError::Unavailable("index unreadable".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CacheStore for FaultyStore {
        async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
            if let Some(suffix) = self.refuse_puts
                && entry.fingerprint.as_str().ends_with(suffix)
            {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.put(entry).await
        }

        async fn get(
            &self,
            namespace: &CacheNamespace,
            fingerprint: &RequestFingerprint,
        ) -> Result<Option<CacheEntry>, StoreError> {
            self.inner.get(namespace, fingerprint).await
        }

        async fn delete(&self, namespace: &CacheNamespace) -> Result<bool, StoreError> {
            self.inner.delete(namespace).await
        }

        async fn remove(
            &self,
            namespace: &CacheNamespace,
            fingerprint: &RequestFingerprint,
        ) -> Result<bool, StoreError> {
            self.bookkeeping()?;
            self.inner.remove(namespace, fingerprint).await
        }

        async fn remove_if_unchanged(
            &self,
            namespace: &CacheNamespace,
            stamp: &EntryStamp,
        ) -> Result<bool, StoreError> {
            self.bookkeeping()?;
            self.inner.remove_if_unchanged(namespace, stamp).await
        }

        async fn list_namespaces(&self) -> Result<BTreeSet<CacheNamespace>, StoreError> {
            self.inner.list_namespaces().await
        }

        async fn keys(
            &self,
            namespace: &CacheNamespace,
        ) -> Result<Vec<RequestFingerprint>, StoreError> {
            self.bookkeeping()?;
            self.inner.keys(namespace).await
        }

        async fn entry_log(
            &self,
            namespace: &CacheNamespace,
        ) -> Result<Vec<EntryStamp>, StoreError> {
            self.bookkeeping()?;
            let log = self.inner.entry_log(namespace).await?;
            let pending = self.write_after_log.lock().unwrap().take();
            if let Some(entry) = pending {
                self.inner.put(entry).await?;
            }
            Ok(log)
        }
    }
}
