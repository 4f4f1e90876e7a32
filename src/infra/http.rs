//! Caching proxy front end.
//!
//! Every request except the control endpoint is rewritten onto the upstream
//! origin and handed to the strategy engine. Unrouted requests go straight to
//! the network.

use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    body::Body,
    extract::{Request as HttpRequest, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
};
use http_body_util::{BodyExt, Limited};
use serde_json::{Value, json};
use tracing::{debug, error, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    cache::{
        CacheError, CachedResponse, ControlHandle, ControlRequest, Fetcher, Intercept, Request,
        ResourceType, StrategyEngine,
    },
    config::CONTROL_PATH,
};

use super::fetch::is_hop_by_hop;

pub const SOURCE_HEADER: &str = "x-stowaway-source";
const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    pub engine: StrategyEngine,
    pub fetcher: Arc<dyn Fetcher>,
    pub control: ControlHandle,
    pub upstream: Url,
}

pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route(CONTROL_PATH, post(control))
        .fallback(proxy)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
        .with_state(state)
}

/// Diagnostic attached to failed responses and picked up by `log_responses`.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    fn from_error(source: &'static str, error: &dyn std::error::Error) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }

    fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

async fn set_request_context(mut request: HttpRequest, next: Next) -> Response {
    let ctx = RequestContext {
        request_id: Uuid::new_v4().to_string(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

async fn log_responses(request: HttpRequest, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let Some(report) = response.extensions_mut().remove::<ErrorReport>() else {
        debug!(
            target = "stowaway::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            request_id,
            "request served",
        );
        return response;
    };

    let detail = report.messages.first().cloned().unwrap_or_default();
    if status.is_server_error() {
        error!(
            target = "stowaway::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            source = report.source,
            detail = %detail,
            chain = ?report.messages,
            request_id,
            "request failed",
        );
    } else {
        warn!(
            target = "stowaway::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            source = report.source,
            detail = %detail,
            request_id,
            "client request error",
        );
    }
    response
}

async fn control(State(state): State<ProxyState>, Json(body): Json<Value>) -> Response {
    let request = match ControlRequest::from_value(body) {
        Ok(request) => request,
        Err(err) => {
            let mut response = (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
            ErrorReport::from_error("infra::http::control", &err).attach(&mut response);
            return response;
        }
    };

    match state.control.send(request).await {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => {
            let mut response = (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
            ErrorReport::from_error("infra::http::control", &err).attach(&mut response);
            response
        }
    }
}

async fn proxy(State(state): State<ProxyState>, request: HttpRequest) -> Response {
    let (parts, body) = request.into_parts();
    let body = match Limited::new(body, MAX_REQUEST_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            let mut response =
                (StatusCode::PAYLOAD_TOO_LARGE, "Request body rejected").into_response();
            ErrorReport::from_error("infra::http::proxy", &*err).attach(&mut response);
            return response;
        }
    };

    let url = upstream_url(&state.upstream, &parts.uri);
    let mut intercepted = Request::new(parts.method, url)
        .with_resource_type(resource_type(&parts.headers, &parts.uri))
        .with_body(body);
    intercepted.headers = forwardable_headers(&parts.headers);

    match state.engine.handle(&intercepted).await {
        Ok(Intercept::Handled(outcome)) => render(outcome.response, outcome.source.as_str()),
        Ok(Intercept::PassThrough) => match state.fetcher.fetch(&intercepted).await {
            Ok(response) => render(response, "passthrough"),
            Err(err) => failure(CacheError::network(&intercepted.url, err)),
        },
        Err(err) => failure(err),
    }
}

/// URL the intercepted request targets.
///
/// Absolute-form targets, sent by clients using the proxy as a forward proxy,
/// are kept as-is so origin rules can see them. Origin-form paths map onto
/// the upstream origin.
pub fn upstream_url(upstream: &Url, uri: &Uri) -> Url {
    if uri.scheme().is_some()
        && uri.authority().is_some()
        && let Ok(absolute) = Url::parse(&uri.to_string())
    {
        return absolute;
    }

    let mut url = upstream.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    url
}

/// `Sec-Fetch-Dest` when the client sent one, else a guess from the path.
fn resource_type(headers: &HeaderMap, uri: &Uri) -> ResourceType {
    headers
        .get("sec-fetch-dest")
        .and_then(|value| value.to_str().ok())
        .and_then(ResourceType::from_destination)
        .unwrap_or_else(|| ResourceType::infer_from_path(uri.path()))
}

fn forwardable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn render(cached: CachedResponse, source: &'static str) -> Response {
    // Opaque entries carry status 0, which has no wire form.
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut response = Response::new(Body::from(cached.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &cached.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers.insert(SOURCE_HEADER, HeaderValue::from_static(source));
    response
}

fn failure(err: CacheError) -> Response {
    let (status, message) = match &err {
        CacheError::NetworkUnavailable { .. } => (StatusCode::BAD_GATEWAY, "Upstream unreachable"),
        CacheError::StoreUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Cache storage unavailable")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Unexpected error occurred"),
    };
    let mut response = (status, message).into_response();
    ErrorReport::from_error("infra::http::proxy", &err).attach(&mut response);
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{Method, Request as AxumRequest};
    use tower::ServiceExt;

    use super::*;
    use crate::cache::testing::ScriptedFetcher;
    use crate::cache::{
        CacheNamespace, CacheStore, ControlPlane, LifecycleController, Matcher, MemoryStore,
        RoutingRule, RoutingTable, Strategy,
    };

    struct Proxy {
        router: Router,
        store: Arc<MemoryStore>,
        fetcher: Arc<ScriptedFetcher>,
    }

    fn upstream() -> Url {
        Url::parse("https://app.example.com").expect("upstream")
    }

    fn assets() -> CacheNamespace {
        CacheNamespace::new("assets", "v1")
    }

    fn cdn() -> CacheNamespace {
        CacheNamespace::new("cdn", "v1")
    }

    fn proxy_with(fetcher: ScriptedFetcher) -> Proxy {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(fetcher);
        let routes = RoutingTable::new(vec![
            RoutingRule::new(
                "assets",
                Matcher::PathPrefix("/assets/".into()),
                Strategy::CacheFirst,
                assets(),
            ),
            RoutingRule::new(
                "cdn",
                Matcher::Origin("http://cdn.example.net".into()),
                Strategy::CacheFirst,
                cdn(),
            ),
        ])
        .with_origin(upstream().origin());
        let engine = StrategyEngine::new(store.clone(), fetcher.clone(), routes);
        let lifecycle = Arc::new(LifecycleController::new(
            store.clone(),
            fetcher.clone(),
            CacheNamespace::new("precache", "v1"),
            [assets()],
        ));
        let plane = Arc::new(
            ControlPlane::new(store.clone(), lifecycle).with_default_namespace(assets()),
        );
        let (control, _task) = plane.spawn(8);

        let router = build_router(ProxyState {
            engine,
            fetcher: fetcher.clone(),
            control,
            upstream: upstream(),
        });
        Proxy {
            router,
            store,
            fetcher,
        }
    }

    async fn get(router: &Router, path: &str) -> Response {
        router
            .clone()
            .oneshot(
                AxumRequest::builder()
                    .uri(path)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response")
    }

    async fn body_text(response: Response) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf-8")
    }

    async fn post_control(router: &Router, body: Value) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(
                AxumRequest::builder()
                    .method(Method::POST)
                    .uri(CONTROL_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let value = serde_json::from_str(&body_text(response).await).expect("json");
        (status, value)
    }

    #[tokio::test]
    async fn routed_requests_are_cached_and_tagged() {
        let proxy = proxy_with(ScriptedFetcher::ok("console.log(1)"));

        let first = get(&proxy.router, "/assets/app.js").await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[SOURCE_HEADER], "network");

        let second = get(&proxy.router, "/assets/app.js").await;
        assert_eq!(second.headers()[SOURCE_HEADER], "cache");
        assert_eq!(body_text(second).await, "console.log(1)");

        assert_eq!(proxy.fetcher.calls(), 1);
        assert_eq!(proxy.store.keys(&assets()).await.expect("keys").len(), 1);
    }

    #[tokio::test]
    async fn unrouted_requests_pass_through() {
        let proxy = proxy_with(ScriptedFetcher::ok("hello"));

        let response = get(&proxy.router, "/api/songs?page=2").await;
        assert_eq!(response.headers()[SOURCE_HEADER], "passthrough");
        assert_eq!(body_text(response).await, "hello");
        assert!(proxy.store.is_empty());
    }

    #[tokio::test]
    async fn network_failures_map_to_bad_gateway() {
        let proxy = proxy_with(ScriptedFetcher::failing());

        let routed = get(&proxy.router, "/assets/app.js").await;
        assert_eq!(routed.status(), StatusCode::BAD_GATEWAY);

        let unrouted = get(&proxy.router, "/api").await;
        assert_eq!(unrouted.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn control_endpoint_answers_status_and_clear() {
        let proxy = proxy_with(ScriptedFetcher::ok("x"));
        get(&proxy.router, "/assets/a.css").await;

        let (status, reply) = post_control(&proxy.router, json!({"action": "getStatus"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["count"], 1);

        let (_, reply) = post_control(&proxy.router, json!({"action": "clearCache"})).await;
        assert_eq!(reply, json!({"success": true}));
        assert!(proxy.store.is_empty());
    }

    #[tokio::test]
    async fn control_endpoint_accepts_legacy_skip_waiting() {
        let proxy = proxy_with(ScriptedFetcher::ok("x"));
        let (status, reply) = post_control(&proxy.router, json!("SKIP_WAITING")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(reply.get("activated").is_some());
    }

    #[tokio::test]
    async fn malformed_control_requests_are_rejected() {
        let proxy = proxy_with(ScriptedFetcher::ok("x"));
        let (status, reply) = post_control(&proxy.router, json!({"action": "reboot"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(reply["error"].is_string());
    }

    #[test]
    fn rewrites_onto_upstream() {
        let uri: Uri = "/assets/app.js?v=3".parse().expect("uri");
        assert_eq!(
            upstream_url(&upstream(), &uri).as_str(),
            "https://app.example.com/assets/app.js?v=3"
        );
    }

    #[test]
    fn keeps_absolute_form_targets() {
        let uri: Uri = "http://cdn.example.net/npm/lib.js?v=1".parse().expect("uri");
        assert_eq!(
            upstream_url(&upstream(), &uri).as_str(),
            "http://cdn.example.net/npm/lib.js?v=1"
        );
    }

    #[tokio::test]
    async fn forward_proxy_requests_reach_origin_rules() {
        let proxy = proxy_with(ScriptedFetcher::ok("export {}"));

        let first = get(&proxy.router, "http://cdn.example.net/npm/lib.js").await;
        assert_eq!(first.headers()[SOURCE_HEADER], "network");
        let second = get(&proxy.router, "http://cdn.example.net/npm/lib.js").await;
        assert_eq!(second.headers()[SOURCE_HEADER], "cache");

        let cached = proxy.store.keys(&cdn()).await.expect("keys");
        assert_eq!(cached.len(), 1);
        assert!(cached[0].as_str().contains("cdn.example.net"));

        // The same path on the upstream origin is not a CDN request.
        let local = get(&proxy.router, "/npm/lib.js").await;
        assert_eq!(local.headers()[SOURCE_HEADER], "passthrough");
    }

    #[test]
    fn classifies_by_destination_then_path() {
        let uri: Uri = "/assets/app".parse().expect("uri");
        let mut headers = HeaderMap::new();
        assert_eq!(resource_type(&headers, &uri), ResourceType::Other);

        headers.insert("sec-fetch-dest", HeaderValue::from_static("script"));
        assert_eq!(resource_type(&headers, &uri), ResourceType::Script);
    }

    #[test]
    fn render_strips_hop_by_hop_headers() {
        let response = render(
            CachedResponse::ok("x")
                .with_header("Content-Type", "text/css")
                .with_header("Transfer-Encoding", "chunked"),
            "cache",
        );
        assert_eq!(response.headers()["content-type"], "text/css");
        assert!(response.headers().get("transfer-encoding").is_none());
    }
}
