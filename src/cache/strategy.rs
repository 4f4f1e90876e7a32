//! Strategy execution.
//!
//! `StrategyEngine::handle` resolves a request against the routing table and
//! runs the matched rule's strategy against the store and the network.
//! Store failures on the request path are logged and treated as misses or
//! skipped writes; only network failures without a cached answer or
//! fallback reach the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::clock::{Clock, SystemClock};
use super::error::CacheError;
use super::expiration::EvictionReport;
use super::keys::{CacheNamespace, RequestFingerprint};
use super::network::{FetchError, Fetcher, Request};
use super::revalidation::RevalidationTracker;
use super::routing::{FallbackSource, RoutingRule, RoutingTable, Strategy};
use super::store::{CacheEntry, CacheStore, CachedResponse};

const METRIC_CACHE_HIT: &str = "stowaway_cache_hit_total";
const METRIC_CACHE_MISS: &str = "stowaway_cache_miss_total";
const METRIC_NETWORK_FAILURE: &str = "stowaway_network_failure_total";
const METRIC_CACHE_WRITE: &str = "stowaway_cache_write_total";
const METRIC_FETCH_MS: &str = "stowaway_fetch_ms";

pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(3);

/// Where a handled response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    Fallback,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Network => "network",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug)]
pub struct StrategyOutcome {
    pub response: CachedResponse,
    pub source: ResponseSource,
    /// Detached background refresh, if one was started. Dropping the handle
    /// does not cancel it.
    pub revalidation: Option<JoinHandle<()>>,
}

impl StrategyOutcome {
    fn new(response: CachedResponse, source: ResponseSource) -> Self {
        Self {
            response,
            source,
            revalidation: None,
        }
    }
}

#[derive(Debug)]
pub enum Intercept {
    /// No rule matched; the host should send the request untouched.
    PassThrough,
    Handled(StrategyOutcome),
}

impl Intercept {
    pub fn into_outcome(self) -> Option<StrategyOutcome> {
        match self {
            Self::PassThrough => None,
            Self::Handled(outcome) => Some(outcome),
        }
    }
}

/// Runs routing rules against a store and a network capability.
///
/// Cheap to clone; background refreshes carry their own clone.
#[derive(Clone)]
pub struct StrategyEngine {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    routes: Arc<RoutingTable>,
    clock: Arc<dyn Clock>,
    revalidations: RevalidationTracker,
    default_timeout: Duration,
}

impl StrategyEngine {
    pub fn new(store: Arc<dyn CacheStore>, fetcher: Arc<dyn Fetcher>, routes: RoutingTable) -> Self {
        Self {
            store,
            fetcher,
            routes: Arc::new(routes),
            clock: Arc::new(SystemClock),
            revalidations: RevalidationTracker::new(),
            default_timeout: DEFAULT_NETWORK_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Wait used by network-first fetches when the rule sets none.
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn revalidations(&self) -> &RevalidationTracker {
        &self.revalidations
    }

    /// Resolve and execute; `PassThrough` when no rule applies.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn handle(&self, request: &Request) -> Result<Intercept, CacheError> {
        let Some(rule) = self.routes.resolve(request) else {
            debug!("No route matched, passing through");
            return Ok(Intercept::PassThrough);
        };

        let outcome = self.execute(rule, request).await?;
        debug!(
            rule = %rule.name,
            strategy = %rule.strategy,
            outcome = outcome.source.as_str(),
            status = outcome.response.status,
            "Request handled"
        );
        Ok(Intercept::Handled(outcome))
    }

    /// Run `rule`'s strategy for `request`, bypassing resolution.
    pub async fn execute(
        &self,
        rule: &RoutingRule,
        request: &Request,
    ) -> Result<StrategyOutcome, CacheError> {
        let fingerprint = RequestFingerprint::from_request(request, &rule.vary_headers);
        match rule.strategy {
            Strategy::CacheFirst => self.cache_first(rule, request, &fingerprint).await,
            Strategy::NetworkFirst => self.network_first(rule, request, &fingerprint).await,
            Strategy::StaleWhileRevalidate => {
                self.stale_while_revalidate(rule, request, &fingerprint).await
            }
            Strategy::NetworkOnly => self.network_only(rule, request).await,
        }
    }

    async fn cache_first(
        &self,
        rule: &RoutingRule,
        request: &Request,
        fingerprint: &RequestFingerprint,
    ) -> Result<StrategyOutcome, CacheError> {
        if let Some(cached) = self.lookup(rule, fingerprint).await {
            return Ok(StrategyOutcome::new(cached, ResponseSource::Cache));
        }

        match self.fetch(rule, request, None).await {
            Ok(response) => {
                self.store_best_effort(rule, fingerprint, &response).await;
                Ok(StrategyOutcome::new(response, ResponseSource::Network))
            }
            Err(err) => {
                self.fallback(rule, request, CacheError::network(&request.url, err))
                    .await
            }
        }
    }

    async fn network_first(
        &self,
        rule: &RoutingRule,
        request: &Request,
        fingerprint: &RequestFingerprint,
    ) -> Result<StrategyOutcome, CacheError> {
        let timeout = rule.network_timeout.unwrap_or(self.default_timeout);
        match self.fetch(rule, request, Some(timeout)).await {
            Ok(response) => {
                self.store_best_effort(rule, fingerprint, &response).await;
                Ok(StrategyOutcome::new(response, ResponseSource::Network))
            }
            Err(err) => {
                if let Some(cached) = self.lookup(rule, fingerprint).await {
                    debug!(error = %err, "Network failed, serving cached copy");
                    return Ok(StrategyOutcome::new(cached, ResponseSource::Cache));
                }
                self.fallback(rule, request, CacheError::network(&request.url, err))
                    .await
            }
        }
    }

    async fn stale_while_revalidate(
        &self,
        rule: &RoutingRule,
        request: &Request,
        fingerprint: &RequestFingerprint,
    ) -> Result<StrategyOutcome, CacheError> {
        let Some(cached) = self.lookup(rule, fingerprint).await else {
            return self.network_first(rule, request, fingerprint).await;
        };

        let mut outcome = StrategyOutcome::new(cached, ResponseSource::Cache);
        outcome.revalidation = self.spawn_refresh(rule, request, fingerprint);
        Ok(outcome)
    }

    async fn network_only(
        &self,
        rule: &RoutingRule,
        request: &Request,
    ) -> Result<StrategyOutcome, CacheError> {
        self.fetch(rule, request, None)
            .await
            .map(|response| StrategyOutcome::new(response, ResponseSource::Network))
            .map_err(|err| CacheError::network(&request.url, err))
    }

    fn spawn_refresh(
        &self,
        rule: &RoutingRule,
        request: &Request,
        fingerprint: &RequestFingerprint,
    ) -> Option<JoinHandle<()>> {
        let Some(guard) = self.revalidations.try_start(&rule.namespace, fingerprint) else {
            debug!(fingerprint = %fingerprint, "Refresh already in flight");
            return None;
        };

        let engine = self.clone();
        let rule = rule.clone();
        let request = request.clone();
        let fingerprint = fingerprint.clone();

        Some(tokio::spawn(async move {
            let _guard = guard;
            match engine.fetch(&rule, &request, None).await {
                Ok(response) => {
                    engine
                        .store_best_effort(&rule, &fingerprint, &response)
                        .await;
                }
                Err(err) => {
                    warn!(
                        namespace = %rule.namespace,
                        fingerprint = %fingerprint,
                        error = %err,
                        "Background refresh failed"
                    );
                }
            }
        }))
    }

    /// Fresh cached response for the slot; store errors count as a miss.
    async fn lookup(
        &self,
        rule: &RoutingRule,
        fingerprint: &RequestFingerprint,
    ) -> Option<CachedResponse> {
        let strategy = rule.strategy.as_str();
        let found = match self.store.get(&rule.namespace, fingerprint).await {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    namespace = %rule.namespace,
                    fingerprint = %fingerprint,
                    error = %err,
                    "Cache read failed, treating as miss"
                );
                None
            }
        };

        match found {
            Some(entry) if rule.expiration.is_fresh(&entry, self.clock.now()) => {
                counter!(METRIC_CACHE_HIT, "strategy" => strategy).increment(1);
                Some(entry.response)
            }
            Some(_) => {
                debug!(fingerprint = %fingerprint, "Cached entry expired");
                counter!(METRIC_CACHE_MISS, "strategy" => strategy).increment(1);
                None
            }
            None => {
                counter!(METRIC_CACHE_MISS, "strategy" => strategy).increment(1);
                None
            }
        }
    }

    async fn fetch(
        &self,
        rule: &RoutingRule,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<CachedResponse, FetchError> {
        let started_at = Instant::now();
        let result = match timeout {
            Some(after) => match tokio::time::timeout(after, self.fetcher.fetch(request)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout { after }),
            },
            None => self.fetcher.fetch(request).await,
        };

        histogram!(METRIC_FETCH_MS, "strategy" => rule.strategy.as_str())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        if result.is_err() {
            counter!(METRIC_NETWORK_FAILURE, "strategy" => rule.strategy.as_str()).increment(1);
        }
        result
    }

    /// Validate, write and expire. The caller keeps its own copy of `response`.
    async fn write_through(
        &self,
        rule: &RoutingRule,
        fingerprint: &RequestFingerprint,
        response: &CachedResponse,
    ) -> Result<EvictionReport, CacheError> {
        if !rule.cacheable.allows(response) {
            return Err(CacheError::EntryNotCacheable {
                fingerprint: fingerprint.to_string(),
                status: response.status,
            });
        }

        let now = self.clock.now();
        let entry = CacheEntry::new(
            rule.namespace.clone(),
            fingerprint.clone(),
            response.clone(),
            now,
        );
        self.store.put(entry).await?;
        counter!(METRIC_CACHE_WRITE, "strategy" => rule.strategy.as_str()).increment(1);

        Ok(rule
            .expiration
            .enforce(self.store.as_ref(), &rule.namespace, now)
            .await)
    }

    async fn store_best_effort(
        &self,
        rule: &RoutingRule,
        fingerprint: &RequestFingerprint,
        response: &CachedResponse,
    ) {
        match self.write_through(rule, fingerprint, response).await {
            Ok(_) => {}
            Err(CacheError::EntryNotCacheable { status, .. }) => {
                debug!(fingerprint = %fingerprint, status, "Response not cacheable, skipping write");
            }
            Err(err) => {
                warn!(
                    namespace = %rule.namespace,
                    fingerprint = %fingerprint,
                    error = %err,
                    "Cache write failed"
                );
            }
        }
    }

    /// Try the rule's fallbacks in order; `err` if none answers.
    async fn fallback(
        &self,
        rule: &RoutingRule,
        request: &Request,
        err: CacheError,
    ) -> Result<StrategyOutcome, CacheError> {
        for fallback in rule.fallbacks.iter().filter(|f| f.applies_to(request)) {
            let response = match &fallback.source {
                FallbackSource::Cached { url, namespace } => {
                    self.find_cached(&RequestFingerprint::for_url(url), namespace.as_ref())
                        .await
                }
                FallbackSource::Offline {
                    status,
                    content_type,
                    body,
                } => Some(
                    CachedResponse::new(*status, body.clone())
                        .with_header("Content-Type", content_type.as_str()),
                ),
            };

            if let Some(response) = response {
                debug!(rule = %rule.name, status = response.status, "Serving fallback");
                return Ok(StrategyOutcome::new(response, ResponseSource::Fallback));
            }
        }

        Err(err)
    }

    async fn find_cached(
        &self,
        fingerprint: &RequestFingerprint,
        namespace: Option<&CacheNamespace>,
    ) -> Option<CachedResponse> {
        let candidates = match namespace {
            Some(namespace) => vec![namespace.clone()],
            None => match self.store.list_namespaces().await {
                Ok(all) => all.into_iter().collect(),
                Err(err) => {
                    warn!(error = %err, "Unable to list namespaces for fallback");
                    return None;
                }
            },
        };

        for namespace in candidates {
            match self.store.get(&namespace, fingerprint).await {
                Ok(Some(entry)) => return Some(entry.response),
                Ok(None) => {}
                Err(err) => {
                    warn!(namespace = %namespace, error = %err, "Fallback lookup failed");
                }
            }
        }
        None
    }
}
