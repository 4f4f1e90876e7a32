//! Data-driven request routing.
//!
//! A `RoutingTable` is an ordered list of rules; the first whose matcher
//! accepts a request decides the strategy and namespace. No rule (and no
//! default) means the request passes through untouched.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::{Origin, Url};

use super::cacheable::CacheablePolicy;
use super::expiration::ExpirationPolicy;
use super::keys::CacheNamespace;
use super::network::{Request, ResourceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    NetworkOnly,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache_first",
            Self::NetworkFirst => "network_first",
            Self::StaleWhileRevalidate => "stale_while_revalidate",
            Self::NetworkOnly => "network_only",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Code-supplied matcher for tables built outside configuration.
#[derive(Clone)]
pub struct RequestPredicate(Arc<dyn Fn(&Request) -> bool + Send + Sync>);

impl RequestPredicate {
    pub fn new(predicate: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }
}

impl fmt::Debug for RequestPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestPredicate(..)")
    }
}

/// Pure predicate over method, URL and resource type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    Any,
    /// Case-insensitive method name.
    Method(String),
    /// Same scheme, host and port as the table's origin.
    SameOrigin,
    /// ASCII-serialized origin, e.g. `https://cdn.jsdelivr.net`.
    Origin(String),
    HostContains(String),
    PathPrefix(String),
    PathSuffix(String),
    PathContains(String),
    ResourceType(ResourceType),
    /// Full URLs, fragments ignored.
    ExactUrls(BTreeSet<String>),
    All(Vec<Matcher>),
    AnyOf(Vec<Matcher>),
    Not(Box<Matcher>),
    #[serde(skip)]
    Predicate(RequestPredicate),
}

impl Matcher {
    pub fn predicate(predicate: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(RequestPredicate::new(predicate))
    }

    pub fn exact_urls<'a>(urls: impl IntoIterator<Item = &'a Url>) -> Self {
        Self::ExactUrls(urls.into_iter().map(without_fragment).collect())
    }

    pub fn matches(&self, request: &Request, origin: Option<&Origin>) -> bool {
        match self {
            Self::Any => true,
            Self::Method(method) => request.method.as_str().eq_ignore_ascii_case(method),
            Self::SameOrigin => origin.is_some_and(|origin| request.url.origin() == *origin),
            Self::Origin(expected) => {
                request.url.origin().ascii_serialization() == expected.trim_end_matches('/')
            }
            Self::HostContains(needle) => request
                .url
                .host_str()
                .is_some_and(|host| host.contains(needle.as_str())),
            Self::PathPrefix(prefix) => request.url.path().starts_with(prefix.as_str()),
            Self::PathSuffix(suffix) => request.url.path().ends_with(suffix.as_str()),
            Self::PathContains(needle) => request.url.path().contains(needle.as_str()),
            Self::ResourceType(kind) => request.resource_type == *kind,
            Self::ExactUrls(urls) => urls.contains(&without_fragment(&request.url)),
            Self::All(matchers) => matchers.iter().all(|m| m.matches(request, origin)),
            Self::AnyOf(matchers) => matchers.iter().any(|m| m.matches(request, origin)),
            Self::Not(inner) => !inner.matches(request, origin),
            Self::Predicate(predicate) => (predicate.0)(request),
        }
    }
}

fn without_fragment(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

/// Where a failed request may still find an answer.
#[derive(Debug, Clone)]
pub enum FallbackSource {
    /// A cached URL; `namespace: None` searches every namespace.
    Cached {
        url: Url,
        namespace: Option<CacheNamespace>,
    },
    /// A synthetic response, e.g. `503 Offline`.
    Offline {
        status: u16,
        content_type: String,
        body: Bytes,
    },
}

#[derive(Debug, Clone)]
pub struct Fallback {
    pub source: FallbackSource,
    /// Only applies to requests of this type when set.
    pub resource_type: Option<ResourceType>,
}

impl Fallback {
    pub fn cached(url: Url) -> Self {
        Self {
            source: FallbackSource::Cached {
                url,
                namespace: None,
            },
            resource_type: None,
        }
    }

    pub fn offline(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            source: FallbackSource::Offline {
                status,
                content_type: "text/plain; charset=utf-8".to_string(),
                body: body.into(),
            },
            resource_type: None,
        }
    }

    pub fn in_namespace(mut self, namespace: CacheNamespace) -> Self {
        if let FallbackSource::Cached { namespace: slot, .. } = &mut self.source {
            *slot = Some(namespace);
        }
        self
    }

    pub fn for_resource(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = Some(resource_type);
        self
    }

    pub fn applies_to(&self, request: &Request) -> bool {
        self.resource_type
            .is_none_or(|kind| kind == request.resource_type)
    }
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: String,
    pub matcher: Matcher,
    pub strategy: Strategy,
    pub namespace: CacheNamespace,
    pub expiration: ExpirationPolicy,
    pub cacheable: CacheablePolicy,
    /// Bounded wait for network-first fetches; the engine default when unset.
    pub network_timeout: Option<Duration>,
    /// Request headers folded into the fingerprint.
    pub vary_headers: Vec<String>,
    pub fallbacks: Vec<Fallback>,
}

impl RoutingRule {
    pub fn new(
        name: impl Into<String>,
        matcher: Matcher,
        strategy: Strategy,
        namespace: CacheNamespace,
    ) -> Self {
        Self {
            name: name.into(),
            matcher,
            strategy,
            namespace,
            expiration: ExpirationPolicy::default(),
            cacheable: CacheablePolicy::default(),
            network_timeout: None,
            vary_headers: Vec::new(),
            fallbacks: Vec::new(),
        }
    }

    pub fn with_expiration(mut self, expiration: ExpirationPolicy) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_cacheable(mut self, cacheable: CacheablePolicy) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }

    pub fn with_vary_headers(mut self, headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.vary_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallbacks.push(fallback);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
    default_rule: Option<RoutingRule>,
    origin: Option<Origin>,
    methods: Option<Vec<Method>>,
}

impl RoutingTable {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    /// Origin that `Matcher::SameOrigin` compares against.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Rule used when nothing else matches.
    pub fn with_default(mut self, rule: RoutingRule) -> Self {
        self.default_rule = Some(rule);
        self
    }

    /// Only intercept these methods; everything else passes through.
    pub fn restrict_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    pub fn push(&mut self, rule: RoutingRule) {
        self.rules.push(rule);
    }

    /// Serve exactly the precached URLs cache-first, ahead of every other rule.
    pub fn with_precache_route<'a>(
        mut self,
        namespace: CacheNamespace,
        urls: impl IntoIterator<Item = &'a Url>,
    ) -> Self {
        let matcher = Matcher::All(vec![
            Matcher::Method("GET".to_string()),
            Matcher::exact_urls(urls),
        ]);
        let rule = RoutingRule::new("precache", matcher, Strategy::CacheFirst, namespace);
        self.rules.insert(0, rule);
        self
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// First matching rule, then the default rule, else `None`.
    pub fn resolve(&self, request: &Request) -> Option<&RoutingRule> {
        if let Some(methods) = &self.methods
            && !methods.contains(&request.method)
        {
            return None;
        }

        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(request, self.origin.as_ref()))
            .or(self.default_rule.as_ref())
    }

    /// Every namespace a rule writes to, which activation treats as current.
    pub fn namespaces(&self) -> BTreeSet<CacheNamespace> {
        self.rules
            .iter()
            .chain(self.default_rule.iter())
            .filter(|rule| rule.strategy != Strategy::NetworkOnly)
            .map(|rule| rule.namespace.clone())
            .collect()
    }
}
