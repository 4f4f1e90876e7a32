//! Durable cache store.
//!
//! Layout under the root directory:
//!
//! ```text
//! {root}/{sha256(name, version_tag)}/namespace.json
//! {root}/{sha256(name, version_tag)}/entries/{sha256(fingerprint)}.json
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! reader sees either the previous entry or the new one.
//!
//! Each namespace keeps an in-memory index of entry stamps, loaded on first
//! use and updated by every write, so `keys` and `entry_log` never touch the
//! entry files. Writes to one namespace serialize on that namespace's lock.

use std::collections::{BTreeSet, HashMap};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::keys::{CacheNamespace, RequestFingerprint};
use super::store::{CacheEntry, CacheStore, CachedResponse, EntryStamp, ResponseKind, StoreError};

const NAMESPACE_FILE: &str = "namespace.json";
const ENTRIES_DIR: &str = "entries";

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    fingerprint: String,
    sequence: u64,
    stored_at: OffsetDateTime,
    #[serde(default)]
    revision: Option<String>,
    status: u16,
    kind: ResponseKind,
    headers: Vec<(String, String)>,
    body: String,
}

impl StoredEntry {
    fn from_entry(entry: &CacheEntry, sequence: u64) -> Self {
        Self {
            fingerprint: entry.fingerprint.as_str().to_string(),
            sequence,
            stored_at: entry.stored_at,
            revision: entry.revision.clone(),
            status: entry.response.status,
            kind: entry.response.kind,
            headers: entry.response.headers.clone(),
            body: BASE64.encode(&entry.response.body),
        }
    }

    fn into_entry(self, namespace: &CacheNamespace, path: &Path) -> Result<CacheEntry, StoreError> {
        let body = BASE64
            .decode(self.body.as_bytes())
            .map_err(|err| StoreError::Corrupt {
                path: path.display().to_string(),
                reason: format!("body is not valid base64: {err}"),
            })?;

        let response = CachedResponse {
            status: self.status,
            headers: self.headers,
            body: body.into(),
            kind: self.kind,
        };

        Ok(CacheEntry::new(
            namespace.clone(),
            RequestFingerprint::from_raw(self.fingerprint),
            response,
            self.stored_at,
        )
        .with_revision(self.revision))
    }

    fn stamp(&self) -> EntryStamp {
        EntryStamp {
            fingerprint: RequestFingerprint::from_raw(self.fingerprint.clone()),
            stored_at: self.stored_at,
            sequence: self.sequence,
        }
    }
}

/// The bookkeeping fields of an entry file; the body is skipped unparsed.
#[derive(Debug, Deserialize)]
struct StoredStamp {
    fingerprint: String,
    sequence: u64,
    stored_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct Index {
    loaded: bool,
    stamps: HashMap<RequestFingerprint, EntryStamp>,
}

impl Index {
    fn ordered(&self) -> Vec<EntryStamp> {
        let mut log: Vec<EntryStamp> = self.stamps.values().cloned().collect();
        log.sort_by_key(|stamp| stamp.sequence);
        log
    }
}

/// Filesystem-backed cache store, one directory per namespace.
pub struct DiskStore {
    root: PathBuf,
    sequence: AtomicU64,
    indexes: DashMap<CacheNamespace, Arc<Mutex<Index>>>,
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Scans existing entries so new writes sort after everything on disk.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|err| StoreError::io("open", err))?;

        let store = Self {
            root,
            sequence: AtomicU64::new(0),
            indexes: DashMap::new(),
        };

        let mut next = 0;
        for namespace in store.list_namespaces().await? {
            for stamp in store.entry_log(&namespace).await? {
                next = next.max(stamp.sequence + 1);
            }
        }
        store.sequence.store(next, Ordering::SeqCst);
        debug!(root = %store.root.display(), next_sequence = next, "Opened disk cache store");

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &CacheNamespace) -> PathBuf {
        self.root.join(namespace.digest())
    }

    fn entry_path(&self, namespace: &CacheNamespace, fingerprint: &RequestFingerprint) -> PathBuf {
        self.namespace_dir(namespace)
            .join(ENTRIES_DIR)
            .join(format!("{}.json", fingerprint.digest()))
    }

    async fn read_entry_file(&self, path: &Path) -> Result<Option<StoredEntry>, StoreError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io("read_entry", err)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                path: path.display().to_string(),
                reason: err.to_string(),
            })
    }

    /// Lock the namespace index, loading it from disk on first use.
    async fn index(
        &self,
        namespace: &CacheNamespace,
    ) -> Result<OwnedMutexGuard<Index>, StoreError> {
        let handle = self.indexes.entry(namespace.clone()).or_default().clone();
        let mut index = handle.lock_owned().await;
        if !index.loaded {
            index.stamps = self.scan(namespace).await?;
            index.loaded = true;
        }
        Ok(index)
    }

    async fn scan(
        &self,
        namespace: &CacheNamespace,
    ) -> Result<HashMap<RequestFingerprint, EntryStamp>, StoreError> {
        let dir = self.namespace_dir(namespace).join(ENTRIES_DIR);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => return Err(StoreError::io("read_dir", err)),
        };

        let mut stamps = HashMap::new();
        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|err| StoreError::io("read_dir", err))?
        {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::io("read_entry", err)),
            };
            match serde_json::from_slice::<StoredStamp>(&raw) {
                Ok(stored) => {
                    let fingerprint = RequestFingerprint::from_raw(stored.fingerprint);
                    let stamp = EntryStamp {
                        fingerprint: fingerprint.clone(),
                        stored_at: stored.stored_at,
                        sequence: stored.sequence,
                    };
                    stamps.insert(fingerprint, stamp);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping corrupt cache entry");
                }
            }
        }

        debug!(namespace = %namespace, entries = stamps.len(), "Loaded namespace index");
        Ok(stamps)
    }

    async fn remove_file(
        &self,
        namespace: &CacheNamespace,
        fingerprint: &RequestFingerprint,
    ) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.entry_path(namespace, fingerprint)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::io("remove", err)),
        }
    }
}

/// Write `bytes` to `path` through a temp file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Unavailable(format!("`{}` has no parent", path.display())))?;
    std::fs::create_dir_all(dir).map_err(|err| StoreError::io("create_dir", err))?;

    let mut file = NamedTempFile::new_in(dir).map_err(|err| StoreError::io("tempfile", err))?;
    file.write_all(bytes)
        .map_err(|err| StoreError::io("write", err))?;
    file.as_file()
        .sync_all()
        .map_err(|err| StoreError::io("sync", err))?;
    file.persist(path)
        .map_err(|err| StoreError::io("persist", err.error))?;
    Ok(())
}

async fn write_atomic_blocking(path: PathBuf, bytes: Vec<u8>) -> Result<(), StoreError> {
    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
        .await
        .map_err(|err| StoreError::Unavailable(format!("write task failed: {err}")))?
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|err| StoreError::Unavailable(err.to_string()))
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let mut index = self.index(&entry.namespace).await?;

        let meta_path = self.namespace_dir(&entry.namespace).join(NAMESPACE_FILE);
        if !tokio::fs::try_exists(&meta_path)
            .await
            .map_err(|err| StoreError::io("stat", err))?
        {
            write_atomic_blocking(meta_path, encode(&entry.namespace)?).await?;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let stored = StoredEntry::from_entry(&entry, sequence);
        let path = self.entry_path(&entry.namespace, &entry.fingerprint);
        write_atomic_blocking(path, encode(&stored)?).await?;

        index.stamps.insert(entry.fingerprint, stored.stamp());
        Ok(())
    }

    async fn get(
        &self,
        namespace: &CacheNamespace,
        fingerprint: &RequestFingerprint,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let path = self.entry_path(namespace, fingerprint);
        match self.read_entry_file(&path).await? {
            Some(stored) => stored.into_entry(namespace, &path).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, namespace: &CacheNamespace) -> Result<bool, StoreError> {
        let handle = self.indexes.entry(namespace.clone()).or_default().clone();
        let mut index = handle.lock_owned().await;
        let existed = match tokio::fs::remove_dir_all(self.namespace_dir(namespace)).await {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                // Partially removed; rescan on next use.
                index.loaded = false;
                return Err(StoreError::io("delete", err));
            }
        };
        index.stamps.clear();
        index.loaded = true;
        Ok(existed)
    }

    async fn remove(
        &self,
        namespace: &CacheNamespace,
        fingerprint: &RequestFingerprint,
    ) -> Result<bool, StoreError> {
        let mut index = self.index(namespace).await?;
        let removed = self.remove_file(namespace, fingerprint).await?;
        index.stamps.remove(fingerprint);
        Ok(removed)
    }

    async fn remove_if_unchanged(
        &self,
        namespace: &CacheNamespace,
        stamp: &EntryStamp,
    ) -> Result<bool, StoreError> {
        let mut index = self.index(namespace).await?;
        let unchanged = index
            .stamps
            .get(&stamp.fingerprint)
            .is_some_and(|current| current.sequence == stamp.sequence);
        if !unchanged {
            return Ok(false);
        }
        let removed = self.remove_file(namespace, &stamp.fingerprint).await?;
        index.stamps.remove(&stamp.fingerprint);
        Ok(removed)
    }

    async fn list_namespaces(&self) -> Result<BTreeSet<CacheNamespace>, StoreError> {
        let mut reader = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|err| StoreError::io("list_namespaces", err))?;

        let mut namespaces = BTreeSet::new();
        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|err| StoreError::io("list_namespaces", err))?
        {
            let meta_path = item.path().join(NAMESPACE_FILE);
            let raw = match tokio::fs::read(&meta_path).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::io("list_namespaces", err)),
            };
            match serde_json::from_slice::<CacheNamespace>(&raw) {
                Ok(namespace) => {
                    namespaces.insert(namespace);
                }
                Err(err) => {
                    warn!(path = %meta_path.display(), error = %err, "Skipping unreadable namespace");
                }
            }
        }

        Ok(namespaces)
    }

    async fn keys(
        &self,
        namespace: &CacheNamespace,
    ) -> Result<Vec<RequestFingerprint>, StoreError> {
        Ok(self
            .index(namespace)
            .await?
            .ordered()
            .into_iter()
            .map(|stamp| stamp.fingerprint)
            .collect())
    }

    async fn entry_log(&self, namespace: &CacheNamespace) -> Result<Vec<EntryStamp>, StoreError> {
        Ok(self.index(namespace).await?.ordered())
    }

    async fn has_namespace(&self, namespace: &CacheNamespace) -> Result<bool, StoreError> {
        tokio::fs::try_exists(self.namespace_dir(namespace).join(NAMESPACE_FILE))
            .await
            .map_err(|err| StoreError::io("has_namespace", err))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn fp(path: &str) -> RequestFingerprint {
        RequestFingerprint::from_raw(format!("GET https://example.com{path}"))
    }

    fn entry(namespace: &CacheNamespace, path: &str, body: &'static str, secs: u64) -> CacheEntry {
        CacheEntry::new(
            namespace.clone(),
            fp(path),
            CachedResponse::ok(body).with_header("Content-Type", "text/plain"),
            OffsetDateTime::UNIX_EPOCH + Duration::from_secs(secs),
        )
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shell = CacheNamespace::new("precache", "v1");

        {
            let store = DiskStore::open(dir.path()).await.unwrap();
            store
                .put(entry(&shell, "/", "<html>", 1).with_revision(Some("r1".into())))
                .await
                .unwrap();
            store.put(entry(&shell, "/app.js", "js", 2)).await.unwrap();
        }

        let store = DiskStore::open(dir.path()).await.unwrap();
        let cached = store.get(&shell, &fp("/")).await.unwrap().expect("entry");
        assert_eq!(cached.response.body, Bytes::from("<html>"));
        assert_eq!(cached.response.header("content-type"), Some("text/plain"));
        assert_eq!(cached.revision.as_deref(), Some("r1"));
        assert_eq!(
            cached.stored_at,
            OffsetDateTime::UNIX_EPOCH + Duration::from_secs(1)
        );

        // New writes sort after what was already on disk.
        store.put(entry(&shell, "/", "<html v2>", 3)).await.unwrap();
        assert_eq!(
            store.keys(&shell).await.unwrap(),
            vec![fp("/app.js"), fp("/")]
        );
    }

    #[tokio::test]
    async fn lists_namespaces_from_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::open(dir.path()).await.unwrap();
        let a = CacheNamespace::new("html-cache", "v1");
        let b = CacheNamespace::new("cdn-unpkgcom", "v1");

        store.put(entry(&a, "/", "a", 0)).await.unwrap();
        store.put(entry(&b, "/lib.js", "b", 0)).await.unwrap();
        std::fs::create_dir_all(dir.path().join("stray")).unwrap();

        assert_eq!(
            store.list_namespaces().await.unwrap(),
            BTreeSet::from([a.clone(), b.clone()])
        );
        assert!(store.has_namespace(&a).await.unwrap());
    }

    #[tokio::test]
    async fn delete_and_remove_are_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::open(dir.path()).await.unwrap();
        let ns = CacheNamespace::new("js-cache", "v1");

        store.put(entry(&ns, "/a.js", "a", 0)).await.unwrap();
        store.put(entry(&ns, "/b.js", "b", 0)).await.unwrap();

        assert!(store.remove(&ns, &fp("/a.js")).await.unwrap());
        assert!(!store.remove(&ns, &fp("/a.js")).await.unwrap());
        assert_eq!(store.keys(&ns).await.unwrap(), vec![fp("/b.js")]);

        assert!(store.delete(&ns).await.unwrap());
        assert!(!store.delete(&ns).await.unwrap());
        assert!(store.list_namespaces().await.unwrap().is_empty());
        assert!(store.get(&ns, &fp("/b.js")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped_in_listings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ns = CacheNamespace::new("img", "v1");
        {
            let store = DiskStore::open(dir.path()).await.unwrap();
            store.put(entry(&ns, "/logo.png", "png", 0)).await.unwrap();
        }

        let garbage = dir.path().join(ns.digest()).join(ENTRIES_DIR).join("junk.json");
        std::fs::write(&garbage, b"{not json").unwrap();

        let store = DiskStore::open(dir.path()).await.unwrap();
        assert_eq!(store.keys(&ns).await.unwrap(), vec![fp("/logo.png")]);
    }

    #[tokio::test]
    async fn namespaces_with_equal_storage_names_stay_apart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::open(dir.path()).await.unwrap();
        let left = CacheNamespace::new("a-b", "v1");
        let right = CacheNamespace::new("a", "b-v1");

        store.put(entry(&left, "/x", "left", 0)).await.unwrap();
        store.put(entry(&right, "/x", "right", 0)).await.unwrap();
        assert!(store.delete(&left).await.unwrap());

        let kept = store.get(&right, &fp("/x")).await.unwrap().expect("entry");
        assert_eq!(kept.response.body, Bytes::from("right"));
        assert_eq!(
            store.list_namespaces().await.unwrap(),
            BTreeSet::from([right.clone()])
        );
    }

    #[tokio::test]
    async fn namespace_names_cannot_escape_the_root() {
        let parent = tempfile::tempdir().expect("tempdir");
        let root = parent.path().join("cache");
        let store = DiskStore::open(root.clone()).await.unwrap();
        let hostile = CacheNamespace::new("../outside", "v1");

        store.put(entry(&hostile, "/", "x", 0)).await.unwrap();

        assert!(store.namespace_dir(&hostile).starts_with(&root));
        let siblings: Vec<_> = std::fs::read_dir(parent.path())
            .unwrap()
            .map(|item| item.unwrap().file_name())
            .collect();
        assert_eq!(siblings, vec![std::ffi::OsString::from("cache")]);
        assert_eq!(
            store.list_namespaces().await.unwrap(),
            BTreeSet::from([hostile])
        );
    }

    #[tokio::test]
    async fn conditional_remove_spares_rewritten_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::open(dir.path()).await.unwrap();
        let ns = CacheNamespace::new("pages", "v1");

        store.put(entry(&ns, "/", "first", 0)).await.unwrap();
        let stale = store.entry_log(&ns).await.unwrap().remove(0);
        store.put(entry(&ns, "/", "second", 1)).await.unwrap();

        assert!(!store.remove_if_unchanged(&ns, &stale).await.unwrap());
        let kept = store.get(&ns, &fp("/")).await.unwrap().expect("entry");
        assert_eq!(kept.response.body, Bytes::from("second"));

        let current = store.entry_log(&ns).await.unwrap().remove(0);
        assert!(store.remove_if_unchanged(&ns, &current).await.unwrap());
        assert!(store.get(&ns, &fp("/")).await.unwrap().is_none());
        assert!(store.keys(&ns).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listings_come_from_the_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::open(dir.path()).await.unwrap();
        let ns = CacheNamespace::new("js", "v1");
        store.put(entry(&ns, "/a.js", "a", 0)).await.unwrap();
        store.put(entry(&ns, "/b.js", "b", 1)).await.unwrap();

        // Entry files are only read by `get`; listings never reopen them.
        let entries = dir.path().join(ns.digest()).join(ENTRIES_DIR);
        for item in std::fs::read_dir(&entries).unwrap() {
            std::fs::write(item.unwrap().path(), b"overwritten").unwrap();
        }

        let log = store.entry_log(&ns).await.unwrap();
        assert_eq!(
            log.iter().map(|stamp| stamp.fingerprint.clone()).collect::<Vec<_>>(),
            vec![fp("/a.js"), fp("/b.js")]
        );
        assert_eq!(
            log[1].stored_at,
            OffsetDateTime::UNIX_EPOCH + Duration::from_secs(1)
        );
    }
}
