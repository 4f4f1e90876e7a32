#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use stowaway::cache::{CachedResponse, FetchError, Fetcher, Request};
use url::Url;

/// In-process upstream: serves registered bodies and can be taken offline.
#[derive(Default)]
pub struct Upstream {
    responses: Mutex<HashMap<String, CachedResponse>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl Upstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: &str) {
        self.respond(url, CachedResponse::ok(body.to_string()));
    }

    pub fn respond(&self, url: &str, response: CachedResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for Upstream {
    async fn fetch(&self, request: &Request) -> Result<CachedResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::transport(&request.url, "offline"));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(request.url.as_str())
            .cloned()
            .unwrap_or_else(|| CachedResponse::new(404, "not found")))
    }
}

pub fn url(raw: &str) -> Url {
    Url::parse(raw).expect("valid url")
}

pub fn body(response: &CachedResponse) -> &str {
    std::str::from_utf8(&response.body).expect("utf-8 body")
}
