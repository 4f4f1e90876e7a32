//! Cache configuration.
//!
//! The `[cache]` section of `stowaway.toml`: versioning, lifecycle knobs and
//! the routing rules, which are turned into a `RoutingTable` here.

use std::path::PathBuf;
use std::time::Duration;

use axum::http::Method;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use super::cacheable::CacheablePolicy;
use super::expiration::ExpirationPolicy;
use super::keys::CacheNamespace;
use super::network::ResourceType;
use super::routing::{Fallback, FallbackSource, Matcher, RoutingRule, RoutingTable, Strategy};

const DEFAULT_VERSION: &str = "v1";
const DEFAULT_PRECACHE_NAMESPACE: &str = "precache";
const DEFAULT_NETWORK_TIMEOUT_MS: u64 = 3000;
const DEFAULT_OFFLINE_STATUS: u16 = 503;
const DEFAULT_OFFLINE_BODY: &str = "Offline";
const DEFAULT_OFFLINE_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Error)]
#[error("rule `{rule}`: {reason}")]
pub struct InvalidRule {
    pub rule: String,
    pub reason: String,
}

impl InvalidRule {
    fn new(rule: &str, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

/// Cache configuration from `stowaway.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Version tag appended to every namespace; bump it to orphan old caches.
    pub version: String,
    /// Origin of the application, for `same_origin` rules and relative URLs.
    pub origin: Option<Url>,
    pub precache_namespace: String,
    /// Namespace reported by `getStatus` when none is given.
    pub default_namespace: Option<String>,
    /// Bounded wait for network-first rules without their own timeout.
    pub network_timeout_ms: u64,
    /// Validity filter for rules without their own.
    pub cacheable: CacheablePolicy,
    pub skip_waiting: bool,
    /// Storage-name prefixes that activation never deletes.
    pub preserved_prefixes: Vec<String>,
    /// TOML precache manifest read at startup.
    pub manifest: Option<PathBuf>,
    /// Methods the router intercepts; others always pass through.
    pub intercept_methods: Vec<String>,
    pub rules: Vec<RuleConfig>,
    pub default_rule: Option<RuleConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            origin: None,
            precache_namespace: DEFAULT_PRECACHE_NAMESPACE.to_string(),
            default_namespace: None,
            network_timeout_ms: DEFAULT_NETWORK_TIMEOUT_MS,
            cacheable: CacheablePolicy::default(),
            skip_waiting: true,
            preserved_prefixes: Vec::new(),
            manifest: None,
            intercept_methods: vec!["GET".to_string()],
            rules: Vec::new(),
            default_rule: None,
        }
    }
}

/// One `[[cache.rules]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub matcher: Matcher,
    pub strategy: Strategy,
    /// Bucket name; the version tag is appended.
    pub namespace: String,
    #[serde(default)]
    pub expiration: ExpirationPolicy,
    #[serde(default)]
    pub cacheable: Option<CacheablePolicy>,
    #[serde(default)]
    pub network_timeout_ms: Option<u64>,
    #[serde(default)]
    pub vary_headers: Vec<String>,
    #[serde(default)]
    pub fallbacks: Vec<FallbackConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackConfig {
    Cached {
        url: String,
        /// Bucket to look in; every namespace when unset.
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        resource_type: Option<ResourceType>,
    },
    Offline {
        #[serde(default = "default_offline_status")]
        status: u16,
        #[serde(default = "default_offline_body")]
        body: String,
        #[serde(default = "default_offline_content_type")]
        content_type: String,
        #[serde(default)]
        resource_type: Option<ResourceType>,
    },
}

fn default_offline_status() -> u16 {
    DEFAULT_OFFLINE_STATUS
}

fn default_offline_body() -> String {
    DEFAULT_OFFLINE_BODY.to_string()
}

fn default_offline_content_type() -> String {
    DEFAULT_OFFLINE_CONTENT_TYPE.to_string()
}

/// Names end up in storage names and control requests; keep them plain.
fn check_plain(what: &str, value: &str) -> Result<(), String> {
    if value.contains(['/', '\\']) || value.contains("..") || value.chars().any(char::is_control) {
        return Err(format!(
            "{what} `{value}` must not contain path separators, `..` or control characters"
        ));
    }
    Ok(())
}

impl CacheConfig {
    pub fn namespace(&self, name: &str) -> CacheNamespace {
        CacheNamespace::new(name, self.version.as_str())
    }

    /// `namespace`, rejecting names that are empty or path-like.
    pub fn checked_namespace(&self, name: &str) -> Result<CacheNamespace, String> {
        if name.trim().is_empty() {
            return Err("namespace must not be empty".to_string());
        }
        check_plain("namespace", name)?;
        Ok(self.namespace(name))
    }

    /// The version tag may not contain `-`, so `{name}-{version}` splits one way.
    fn check_version(&self) -> Result<(), InvalidRule> {
        let invalid = |reason: String| InvalidRule::new("version", reason);
        check_plain("version", &self.version).map_err(invalid)?;
        if self.version.contains('-') {
            return Err(invalid(format!(
                "version `{}` must not contain `-`",
                self.version
            )));
        }
        Ok(())
    }

    pub fn precache_namespace(&self) -> CacheNamespace {
        self.namespace(&self.precache_namespace)
    }

    /// `getStatus` default: the configured namespace, else the precache one.
    pub fn default_namespace(&self) -> CacheNamespace {
        match &self.default_namespace {
            Some(name) => self.namespace(name),
            None => self.precache_namespace(),
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Build the routing table described by `rules` and `default_rule`.
    pub fn routes(&self) -> Result<RoutingTable, InvalidRule> {
        self.check_version()?;
        self.checked_namespace(&self.precache_namespace)
            .map_err(|reason| InvalidRule::new("precache_namespace", reason))?;
        if let Some(name) = &self.default_namespace {
            self.checked_namespace(name)
                .map_err(|reason| InvalidRule::new("default_namespace", reason))?;
        }

        let mut table = RoutingTable::default();
        for rule in &self.rules {
            table.push(self.build_rule(rule)?);
        }
        if let Some(rule) = &self.default_rule {
            table = table.with_default(self.build_rule(rule)?);
        }
        if let Some(origin) = &self.origin {
            table = table.with_origin(origin.origin());
        }
        if !self.intercept_methods.is_empty() {
            let methods = self
                .intercept_methods
                .iter()
                .map(|raw| {
                    Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
                        .map_err(|_| InvalidRule::new("intercept_methods", format!("bad method `{raw}`")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            table = table.restrict_methods(methods);
        }
        Ok(table)
    }

    fn build_rule(&self, config: &RuleConfig) -> Result<RoutingRule, InvalidRule> {
        let namespace = self
            .checked_namespace(&config.namespace)
            .map_err(|reason| InvalidRule::new(&config.name, reason))?;
        if let Some(0) = config.expiration.max_entries {
            return Err(InvalidRule::new(&config.name, "max_entries must be at least 1"));
        }

        let mut rule = RoutingRule::new(
            config.name.clone(),
            config.matcher.clone(),
            config.strategy,
            namespace,
        )
        .with_expiration(config.expiration)
        .with_cacheable(config.cacheable.clone().unwrap_or_else(|| self.cacheable.clone()))
        .with_vary_headers(config.vary_headers.iter().cloned());

        if let Some(ms) = config.network_timeout_ms {
            if ms == 0 {
                return Err(InvalidRule::new(&config.name, "network_timeout_ms must be positive"));
            }
            rule = rule.with_network_timeout(Duration::from_millis(ms));
        }

        for fallback in &config.fallbacks {
            rule = rule.with_fallback(self.build_fallback(&config.name, fallback)?);
        }

        Ok(rule)
    }

    fn build_fallback(&self, rule: &str, config: &FallbackConfig) -> Result<Fallback, InvalidRule> {
        match config {
            FallbackConfig::Cached {
                url,
                namespace,
                resource_type,
            } => {
                let url = self.resolve_url(url).map_err(|reason| InvalidRule::new(rule, reason))?;
                let mut fallback = Fallback::cached(url);
                if let Some(name) = namespace {
                    let namespace = self
                        .checked_namespace(name)
                        .map_err(|reason| InvalidRule::new(rule, reason))?;
                    fallback = fallback.in_namespace(namespace);
                }
                fallback.resource_type = *resource_type;
                Ok(fallback)
            }
            FallbackConfig::Offline {
                status,
                body,
                content_type,
                resource_type,
            } => Ok(Fallback {
                source: FallbackSource::Offline {
                    status: *status,
                    content_type: content_type.clone(),
                    body: Bytes::from(body.clone()),
                },
                resource_type: *resource_type,
            }),
        }
    }

    /// Absolute URLs pass through; relative ones resolve against `origin`.
    pub fn resolve_url(&self, raw: &str) -> Result<Url, String> {
        match Url::parse(raw) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self
                    .origin
                    .as_ref()
                    .ok_or_else(|| format!("relative url `{raw}` needs `cache.origin`"))?;
                base.join(raw).map_err(|err| format!("invalid url `{raw}`: {err}"))
            }
            Err(err) => Err(format!("invalid url `{raw}`: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::network::Request;

    const RULES: &str = r#"
        version = "v3"
        origin = "https://app.example.com"
        preserved_prefixes = ["workbox-"]

        [[rules]]
        name = "documents"
        matcher = { resource_type = "document" }
        strategy = "network_first"
        namespace = "html-cache"
        network_timeout_ms = 1500
        fallbacks = [
            { kind = "cached", url = "./index.html", resource_type = "document" },
            { kind = "offline" },
        ]

        [[rules]]
        name = "cdn"
        matcher = { origin = "https://cdn.jsdelivr.net" }
        strategy = "cache_first"
        namespace = "cdn-jsdelivr"
        expiration = { max_entries = 30, max_age_seconds = 7776000 }
        cacheable = { statuses = [0, 200] }

        [default_rule]
        name = "runtime"
        matcher = "any"
        strategy = "network_first"
        namespace = "runtime"
    "#;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.version, "v1");
        assert_eq!(config.precache_namespace().storage_name(), "precache-v1");
        assert_eq!(config.default_namespace(), config.precache_namespace());
        assert_eq!(config.network_timeout(), Duration::from_secs(3));
        assert!(config.skip_waiting);
        assert_eq!(config.intercept_methods, vec!["GET"]);
    }

    #[test]
    fn builds_routes_from_toml() {
        let config: CacheConfig = toml::from_str(RULES).expect("toml");
        let table = config.routes().expect("routes");

        assert_eq!(table.rules().len(), 2);
        let documents = &table.rules()[0];
        assert_eq!(documents.namespace.storage_name(), "html-cache-v3");
        assert_eq!(documents.network_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(documents.fallbacks.len(), 2);
        match &documents.fallbacks[0].source {
            FallbackSource::Cached { url, namespace } => {
                assert_eq!(url.as_str(), "https://app.example.com/index.html");
                assert!(namespace.is_none());
            }
            other => panic!("unexpected fallback {other:?}"),
        }
        match &documents.fallbacks[1].source {
            FallbackSource::Offline { status, body, .. } => {
                assert_eq!(*status, 503);
                assert_eq!(body, "Offline");
            }
            other => panic!("unexpected fallback {other:?}"),
        }

        let cdn = &table.rules()[1];
        assert_eq!(cdn.expiration, ExpirationPolicy::new(Some(30), Some(7_776_000)));
        assert!(cdn.cacheable.statuses.contains(&0));

        let request = Request::get(Url::parse("https://app.example.com/data.bin").expect("url"));
        assert_eq!(table.resolve(&request).expect("default").name, "runtime");

        let post = Request::new(
            Method::POST,
            Url::parse("https://app.example.com/data.bin").expect("url"),
        );
        assert!(table.resolve(&post).is_none());
    }

    #[test]
    fn relative_fallback_without_origin_is_rejected() {
        let mut config: CacheConfig = toml::from_str(RULES).expect("toml");
        config.origin = None;
        let err = config.routes().unwrap_err();
        assert_eq!(err.rule, "documents");
        assert!(err.reason.contains("cache.origin"));
    }

    #[test]
    fn path_like_namespaces_are_rejected() {
        let mut config: CacheConfig = toml::from_str(RULES).expect("toml");
        config.rules[1].namespace = "../../etc".into();
        let err = config.routes().unwrap_err();
        assert_eq!(err.rule, "cdn");
        assert!(err.reason.contains("path separators"));

        let mut config: CacheConfig = toml::from_str(RULES).expect("toml");
        config.precache_namespace = "pre\\cache".into();
        assert_eq!(config.routes().unwrap_err().rule, "precache_namespace");
    }

    #[test]
    fn ambiguous_version_tags_are_rejected() {
        let mut config: CacheConfig = toml::from_str(RULES).expect("toml");
        config.version = "b-v1".into();
        let err = config.routes().unwrap_err();
        assert_eq!(err.rule, "version");
        assert!(err.reason.contains("`-`"));

        config.version = "v1.2.0".into();
        assert!(config.routes().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config: CacheConfig = toml::from_str(RULES).expect("toml");
        config.rules[1].expiration.max_entries = Some(0);
        assert_eq!(config.routes().unwrap_err().rule, "cdn");
    }
}
