//! End-to-end behaviour of install, activation, routing and control over
//! a shared store.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use stowaway::cache::{
    CacheConfig, CacheEntry, CacheNamespace, CacheStore, CachedResponse, ControlPlane,
    ControlReply, ControlRequest, DiskStore, LifecycleController, ManifestEntry, Matcher,
    MemoryStore, PrecacheManifest, Request, RequestFingerprint, ResponseSource, RoutingRule,
    RoutingTable, Strategy, StrategyEngine,
};
use time::OffsetDateTime;

use common::{Upstream, body, url};

const APP: &str = "https://app.example.com";

fn config(version: &str) -> CacheConfig {
    let raw = format!(
        r#"
        version = "{version}"
        origin = "{APP}"
        preserved_prefixes = ["workbox-"]

        [[rules]]
        name = "documents"
        matcher = {{ resource_type = "document" }}
        strategy = "network_first"
        namespace = "html-cache"
        fallbacks = [
            {{ kind = "cached", url = "/offline.html", resource_type = "document" }},
            {{ kind = "offline" }},
        ]

        [[rules]]
        name = "images"
        matcher = {{ resource_type = "image" }}
        strategy = "cache_first"
        namespace = "img-cache"
        expiration = {{ max_entries = 10 }}
        "#
    );
    toml::from_str(&raw).expect("cache config")
}

fn manifest() -> PrecacheManifest {
    PrecacheManifest::new(vec![
        ManifestEntry::new(url(&format!("{APP}/offline.html"))).with_revision("r1"),
        ManifestEntry::new(url(&format!("{APP}/app.js"))).with_revision("r1"),
    ])
}

fn upstream() -> Arc<Upstream> {
    let upstream = Arc::new(Upstream::new());
    upstream.serve(&format!("{APP}/offline.html"), "<h1>offline</h1>");
    upstream.serve(&format!("{APP}/app.js"), "boot()");
    upstream.serve(&format!("{APP}/about/"), "<h1>about</h1>");
    upstream.serve(&format!("{APP}/logo.png"), "png");
    upstream
}

struct Worker {
    engine: StrategyEngine,
    lifecycle: Arc<LifecycleController>,
}

async fn install(
    store: Arc<dyn CacheStore>,
    upstream: Arc<Upstream>,
    version: &str,
) -> Worker {
    let config = config(version);
    let manifest = manifest();
    let routes = config
        .routes()
        .expect("routes")
        .with_precache_route(config.precache_namespace(), manifest.urls());

    let lifecycle = Arc::new(
        LifecycleController::new(
            store.clone(),
            upstream.clone(),
            config.precache_namespace(),
            routes.namespaces(),
        )
        .with_preserved_prefixes(config.preserved_prefixes.clone()),
    );
    lifecycle.on_install(&manifest).await.expect("install");
    assert!(lifecycle.ready_to_activate());
    lifecycle.activate().await.expect("activate");

    let engine = StrategyEngine::new(store, upstream, routes);
    Worker { engine, lifecycle }
}

async fn handle(engine: &StrategyEngine, path: &str) -> stowaway::cache::StrategyOutcome {
    engine
        .handle(&Request::get(url(&format!("{APP}{path}"))))
        .await
        .expect("handled")
        .into_outcome()
        .expect("routed")
}

#[tokio::test]
async fn precached_shell_serves_offline_navigations() {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let upstream = upstream();
    let worker = install(store, upstream.clone(), "v1").await;

    upstream.set_offline(true);

    let script = handle(&worker.engine, "/app.js").await;
    assert_eq!(script.source, ResponseSource::Cache);
    assert_eq!(body(&script.response), "boot()");

    let page = handle(&worker.engine, "/about/").await;
    assert_eq!(page.source, ResponseSource::Fallback);
    assert_eq!(body(&page.response), "<h1>offline</h1>");

    let image = worker
        .engine
        .handle(&Request::get(url(&format!("{APP}/logo.png"))))
        .await;
    assert!(image.is_err_and(|err| err.is_network()));
}

#[tokio::test]
async fn network_first_pages_are_remembered_for_offline_use() {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let upstream = upstream();
    let worker = install(store, upstream.clone(), "v1").await;

    let online = handle(&worker.engine, "/about/").await;
    assert_eq!(online.source, ResponseSource::Network);

    upstream.set_offline(true);
    let offline = handle(&worker.engine, "/about/").await;
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(body(&offline.response), "<h1>about</h1>");
}

#[tokio::test]
async fn version_bump_prunes_previous_caches() {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let upstream = upstream();

    let v1 = install(store.clone(), upstream.clone(), "v1").await;
    handle(&v1.engine, "/logo.png").await;

    let legacy = CacheNamespace::new("workbox-precache", "legacy");
    store
        .put(CacheEntry::new(
            legacy.clone(),
            RequestFingerprint::for_url(&url(&format!("{APP}/old.js"))),
            CachedResponse::ok("old"),
            OffsetDateTime::now_utc(),
        ))
        .await
        .expect("seed legacy");

    let v2 = install(store.clone(), upstream.clone(), "v2").await;
    assert_eq!(v2.lifecycle.state().version, "v2");

    let names: BTreeSet<String> = store
        .list_namespaces()
        .await
        .expect("namespaces")
        .iter()
        .map(CacheNamespace::storage_name)
        .collect();
    assert!(names.contains("precache-v2"));
    assert!(names.contains("workbox-precache-legacy"));
    assert!(!names.contains("precache-v1"));
    assert!(!names.contains("img-cache-v1"));
}

#[tokio::test]
async fn unchanged_revisions_are_not_refetched() {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let upstream = upstream();

    install(store.clone(), upstream.clone(), "v1").await;
    let after_first = upstream.calls();

    let config = config("v1");
    let lifecycle = LifecycleController::new(
        store,
        upstream.clone(),
        config.precache_namespace(),
        [],
    );
    let report = lifecycle.on_install(&manifest()).await.expect("install");

    assert_eq!(report.reused, 2);
    assert_eq!(report.fetched, 0);
    assert_eq!(upstream.calls(), after_first);
}

#[tokio::test]
async fn disk_store_keeps_entries_across_restarts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let upstream = upstream();
    let namespace = CacheNamespace::new("api", "v1");
    let rule = || {
        RoutingRule::new(
            "api",
            Matcher::PathPrefix("/about/".into()),
            Strategy::StaleWhileRevalidate,
            namespace.clone(),
        )
    };

    {
        let store = Arc::new(DiskStore::open(dir.path()).await.expect("open"));
        let engine = StrategyEngine::new(store, upstream.clone(), RoutingTable::new(vec![rule()]));
        let first = handle(&engine, "/about/").await;
        assert_eq!(first.source, ResponseSource::Network);
    }

    upstream.set_offline(true);
    let store = Arc::new(DiskStore::open(dir.path()).await.expect("reopen"));
    let engine = StrategyEngine::new(store, upstream, RoutingTable::new(vec![rule()]));

    let outcome = handle(&engine, "/about/").await;
    assert_eq!(outcome.source, ResponseSource::Cache);
    assert_eq!(body(&outcome.response), "<h1>about</h1>");
    if let Some(refresh) = outcome.revalidation {
        refresh.await.expect("refresh task");
    }
}

#[tokio::test]
async fn control_plane_reports_and_clears_namespaces() {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let worker = install(store.clone(), upstream(), "v1").await;

    let plane = Arc::new(
        ControlPlane::new(store, worker.lifecycle.clone())
            .with_default_namespace(CacheNamespace::new("precache", "v1")),
    );
    let (control, _task) = plane.spawn(4);

    let status = control
        .send(ControlRequest::GetStatus { namespace: None })
        .await
        .expect("status");
    assert!(matches!(status, ControlReply::Status { count: 2, .. }));

    let cleared = control
        .send(ControlRequest::ClearCache {
            namespace: Some("precache-v1".into()),
        })
        .await
        .expect("clear");
    assert_eq!(cleared, ControlReply::Cleared { success: true });

    let status = control
        .send(ControlRequest::GetStatus { namespace: None })
        .await
        .expect("status");
    assert!(matches!(status, ControlReply::Error { .. }));

    let activated = control
        .send(ControlRequest::ForceActivate)
        .await
        .expect("activate");
    assert_eq!(activated, ControlReply::Activated { activated: true });
}
