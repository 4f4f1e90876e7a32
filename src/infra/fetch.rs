//! `Fetcher` backed by a shared `reqwest::Client`.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Origin;

use crate::cache::{CachedResponse, FetchError, Fetcher, Request, ResponseKind};

use super::error::InfraError;

/// Headers scoped to a single connection; never forwarded in either direction.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name))
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    origin: Origin,
}

impl HttpFetcher {
    /// Responses from `origin` are `Basic`, everything else `Cors`.
    pub fn new(origin: Origin) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .build()?;
        Ok(Self { client, origin })
    }

    pub fn user_agent() -> &'static str {
        concat!("stowaway/", env!("CARGO_PKG_VERSION"))
    }

    fn classify(&self, request: &Request) -> ResponseKind {
        if request.url.origin() == self.origin {
            ResponseKind::Basic
        } else {
            ResponseKind::Cors
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn fetch(&self, request: &Request) -> Result<CachedResponse, FetchError> {
        let started = Instant::now();

        let mut outbound = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            outbound = outbound.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            outbound = outbound.body(request.body.clone());
        }

        let response = outbound.send().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout {
                    after: started.elapsed(),
                }
            } else {
                FetchError::transport(&request.url, err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::transport(&request.url, err.to_string()))?;

        debug!(
            status,
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upstream responded"
        );

        Ok(CachedResponse {
            status,
            headers,
            body,
            kind: self.classify(request),
        })
    }
}
