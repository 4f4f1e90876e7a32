//! Install / activate lifecycle.
//!
//! Install precaches a manifest all-or-nothing; activate deletes every
//! namespace that is no longer current and claims clients. The worker's
//! process-wide state lives in `WorkerState` behind a lock instead of in
//! module-level globals.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::cacheable::CacheablePolicy;
use super::clock::{Clock, SystemClock};
use super::error::CacheError;
use super::keys::{CacheNamespace, RequestFingerprint};
use super::lock::{rw_read, rw_write};
use super::network::{Fetcher, Request};
use super::store::{CacheEntry, CacheStore};

const SOURCE: &str = "cache::lifecycle";

/// One URL to precache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: Url,
    /// Content revision; an entry already cached at this revision is reused.
    #[serde(default)]
    pub revision: Option<String>,
    /// Target namespace; the precache namespace when unset.
    #[serde(default)]
    pub namespace: Option<CacheNamespace>,
}

impl ManifestEntry {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            revision: None,
            namespace: None,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn in_namespace(mut self, namespace: CacheNamespace) -> Self {
        self.namespace = Some(namespace);
        self
    }
}

/// Ordered list of URLs written at install time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecacheManifest {
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

impl PrecacheManifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn from_urls(urls: impl IntoIterator<Item = Url>) -> Self {
        Self::new(urls.into_iter().map(ManifestEntry::new).collect())
    }

    pub fn urls(&self) -> impl Iterator<Item = &Url> {
        self.entries.iter().map(|entry| &entry.url)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Installing,
    Installed,
    Activating,
    Active,
    /// A failed install; the previous version stays live.
    Redundant,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerState {
    pub phase: WorkerPhase,
    pub version: String,
    /// Identifies this worker instance in logs.
    pub generation: Uuid,
    /// Installed but waiting for the previous version to let go.
    pub waiting: bool,
    pub clients_claimed: bool,
    pub installed_at: Option<OffsetDateTime>,
    pub activated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub fetched: usize,
    pub reused: usize,
}

/// A slot written during install, with the entry it replaced.
struct Written {
    namespace: CacheNamespace,
    fingerprint: RequestFingerprint,
    prior: Option<CacheEntry>,
}

pub struct LifecycleController {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    precache_namespace: CacheNamespace,
    current: BTreeSet<CacheNamespace>,
    cacheable: CacheablePolicy,
    preserved_prefixes: Vec<String>,
    skip_waiting: bool,
    state: RwLock<WorkerState>,
}

impl LifecycleController {
    /// `current` is the live namespace set; the precache namespace is
    /// always part of it.
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        precache_namespace: CacheNamespace,
        current: impl IntoIterator<Item = CacheNamespace>,
    ) -> Self {
        let mut current: BTreeSet<CacheNamespace> = current.into_iter().collect();
        current.insert(precache_namespace.clone());

        let state = WorkerState {
            phase: WorkerPhase::Idle,
            version: precache_namespace.version_tag.clone(),
            generation: Uuid::new_v4(),
            waiting: false,
            clients_claimed: false,
            installed_at: None,
            activated_at: None,
        };

        Self {
            store,
            fetcher,
            clock: Arc::new(SystemClock),
            precache_namespace,
            current,
            cacheable: CacheablePolicy::default(),
            preserved_prefixes: Vec::new(),
            skip_waiting: true,
            state: RwLock::new(state),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cacheable(mut self, cacheable: CacheablePolicy) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Storage-name prefixes activation never deletes.
    pub fn with_preserved_prefixes(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
        self.preserved_prefixes = prefixes.into_iter().collect();
        self
    }

    /// Take over right after install instead of waiting for `force_activate`.
    pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
        self.skip_waiting = skip_waiting;
        self
    }

    pub fn state(&self) -> WorkerState {
        rw_read(&self.state, SOURCE, "state").clone()
    }

    pub fn precache_namespace(&self) -> &CacheNamespace {
        &self.precache_namespace
    }

    pub fn current_namespaces(&self) -> &BTreeSet<CacheNamespace> {
        &self.current
    }

    fn set_phase(&self, phase: WorkerPhase) {
        rw_write(&self.state, SOURCE, "set_phase").phase = phase;
    }

    /// Installed and not waiting on anyone.
    pub fn ready_to_activate(&self) -> bool {
        let state = rw_read(&self.state, SOURCE, "ready_to_activate");
        state.phase == WorkerPhase::Installed && !state.waiting
    }

    /// Precache every manifest entry, all-or-nothing.
    ///
    /// Nothing is written unless every fetch succeeds with a cacheable
    /// response. A write failure removes the entries already written.
    #[instrument(skip(self, manifest), fields(entries = manifest.entries.len()))]
    pub async fn on_install(&self, manifest: &PrecacheManifest) -> Result<InstallReport, CacheError> {
        self.set_phase(WorkerPhase::Installing);

        match self.precache(manifest).await {
            Ok(report) => {
                let now = self.clock.now();
                let mut state = rw_write(&self.state, SOURCE, "on_install");
                state.phase = WorkerPhase::Installed;
                state.waiting = !self.skip_waiting;
                state.installed_at = Some(now);
                info!(
                    version = %state.version,
                    generation = %state.generation,
                    fetched = report.fetched,
                    reused = report.reused,
                    skip_waiting = self.skip_waiting,
                    "Install complete"
                );
                Ok(report)
            }
            Err(err) => {
                self.set_phase(WorkerPhase::Redundant);
                error!(error = %err, "Install failed, previous version stays live");
                Err(match err {
                    CacheError::InstallFailed { .. } => err,
                    other => CacheError::install("precache aborted", Some(other)),
                })
            }
        }
    }

    async fn precache(&self, manifest: &PrecacheManifest) -> Result<InstallReport, CacheError> {
        let mut pending = Vec::new();
        let mut reused = 0;

        for entry in &manifest.entries {
            let namespace = entry
                .namespace
                .clone()
                .unwrap_or_else(|| self.precache_namespace.clone());
            let fingerprint = RequestFingerprint::for_url(&entry.url);

            let prior = self.prior_entry(&namespace, &fingerprint, entry).await;
            if let (Some(revision), Some(cached)) = (entry.revision.as_deref(), &prior)
                && cached.revision.as_deref() == Some(revision)
            {
                reused += 1;
                continue;
            }
            pending.push((entry, namespace, fingerprint, prior));
        }

        let fetches = pending.iter().map(|(entry, _, fingerprint, _)| async move {
            let response = self
                .fetcher
                .fetch(&Request::get(entry.url.clone()))
                .await
                .map_err(|err| CacheError::network(&entry.url, err))?;
            if !self.cacheable.allows(&response) {
                return Err(CacheError::EntryNotCacheable {
                    fingerprint: fingerprint.to_string(),
                    status: response.status,
                });
            }
            Ok(response)
        });
        let responses = try_join_all(fetches).await?;

        let now = self.clock.now();
        let mut written: Vec<Written> = Vec::new();
        for ((entry, namespace, fingerprint, prior), response) in
            pending.into_iter().zip(responses)
        {
            let cached = CacheEntry::new(namespace.clone(), fingerprint.clone(), response, now)
                .with_revision(entry.revision.clone());
            if let Err(err) = self.store.put(cached).await {
                self.rollback(&written).await;
                return Err(CacheError::install(
                    format!("failed to store `{}`", entry.url),
                    Some(err.into()),
                ));
            }
            written.push(Written {
                namespace,
                fingerprint,
                prior,
            });
        }

        Ok(InstallReport {
            fetched: written.len(),
            reused,
        })
    }

    /// The entry currently in the slot; read errors count as empty.
    async fn prior_entry(
        &self,
        namespace: &CacheNamespace,
        fingerprint: &RequestFingerprint,
        entry: &ManifestEntry,
    ) -> Option<CacheEntry> {
        match self.store.get(namespace, fingerprint).await {
            Ok(found) => found,
            Err(err) => {
                warn!(url = %entry.url, error = %err, "Unable to read cached revision");
                None
            }
        }
    }

    /// Undo this install's writes, restoring whatever each slot held before.
    async fn rollback(&self, written: &[Written]) {
        for slot in written.iter().rev() {
            let restored = match &slot.prior {
                Some(prior) => self.store.put(prior.clone()).await,
                None => self
                    .store
                    .remove(&slot.namespace, &slot.fingerprint)
                    .await
                    .map(|_| ()),
            };
            if let Err(err) = restored {
                warn!(
                    namespace = %slot.namespace,
                    fingerprint = %slot.fingerprint,
                    error = %err,
                    "Failed to roll back precached entry"
                );
            }
        }
    }

    /// Delete every namespace outside `current` (and outside the preserved
    /// prefixes), then claim clients. Returns the deleted namespaces.
    #[instrument(skip(self, current))]
    pub async fn on_activate(
        &self,
        current: &BTreeSet<CacheNamespace>,
    ) -> Result<Vec<CacheNamespace>, CacheError> {
        self.set_phase(WorkerPhase::Activating);

        let deleted = match self.prune(current).await {
            Ok(deleted) => deleted,
            Err(err) => {
                self.set_phase(WorkerPhase::Installed);
                error!(error = %err, "Activation failed");
                return Err(err);
            }
        };

        let now = self.clock.now();
        let mut state = rw_write(&self.state, SOURCE, "on_activate");
        state.phase = WorkerPhase::Active;
        state.waiting = false;
        state.clients_claimed = true;
        state.activated_at = Some(now);
        info!(
            version = %state.version,
            deleted = deleted.len(),
            "Activated and claimed clients"
        );

        Ok(deleted)
    }

    async fn prune(&self, current: &BTreeSet<CacheNamespace>) -> Result<Vec<CacheNamespace>, CacheError> {
        let mut deleted = Vec::new();
        for namespace in self.store.list_namespaces().await? {
            if current.contains(&namespace) || self.is_preserved(&namespace) {
                continue;
            }
            if self.store.delete(&namespace).await? {
                info!(namespace = %namespace, "Deleted obsolete cache namespace");
                deleted.push(namespace);
            }
        }
        Ok(deleted)
    }

    fn is_preserved(&self, namespace: &CacheNamespace) -> bool {
        let name = namespace.storage_name();
        self.preserved_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// Activate against the configured current set.
    pub async fn activate(&self) -> Result<Vec<CacheNamespace>, CacheError> {
        self.on_activate(&self.current).await
    }

    /// Skip waiting and claim now.
    ///
    /// Returns false when there is nothing installed to activate.
    pub async fn force_activate(&self) -> Result<bool, CacheError> {
        let phase = self.state().phase;
        match phase {
            WorkerPhase::Installed => {
                self.activate().await?;
                Ok(true)
            }
            WorkerPhase::Active => {
                rw_write(&self.state, SOURCE, "force_activate").clients_claimed = true;
                Ok(true)
            }
            WorkerPhase::Idle
            | WorkerPhase::Installing
            | WorkerPhase::Activating
            | WorkerPhase::Redundant => {
                warn!(phase = ?phase, "Nothing to activate");
                Ok(false)
            }
        }
    }
}
