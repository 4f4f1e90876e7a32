//! Intercepted requests and the host-provided network capability.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::Method;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::store::CachedResponse;

/// Declared destination of a request, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    #[default]
    Other,
}

impl ResourceType {
    /// Parse a `Sec-Fetch-Dest` style destination.
    pub fn from_destination(destination: &str) -> Option<Self> {
        match destination.trim().to_ascii_lowercase().as_str() {
            "document" | "iframe" | "frame" => Some(Self::Document),
            "script" | "worker" | "sharedworker" | "serviceworker" => Some(Self::Script),
            "style" => Some(Self::Style),
            "image" => Some(Self::Image),
            "font" => Some(Self::Font),
            "manifest" => Some(Self::Manifest),
            "" | "empty" => None,
            _ => Some(Self::Other),
        }
    }

    /// Guess the destination from a URL path when the host did not declare one.
    pub fn infer_from_path(path: &str) -> Self {
        if path.is_empty() || path.ends_with('/') {
            return Self::Document;
        }

        let file = path.rsplit('/').next().unwrap_or(path);
        if file == "manifest.json" {
            return Self::Manifest;
        }

        let Some((_, extension)) = file.rsplit_once('.') else {
            return Self::Other;
        };

        match extension.to_ascii_lowercase().as_str() {
            "html" | "htm" => Self::Document,
            "js" | "mjs" => Self::Script,
            "css" => Self::Style,
            "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "avif" | "ico" => Self::Image,
            "woff" | "woff2" | "ttf" | "otf" | "eot" => Self::Font,
            "webmanifest" => Self::Manifest,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Script => "script",
            Self::Style => "style",
            Self::Image => "image",
            Self::Font => "font",
            Self::Manifest => "manifest",
            Self::Other => "other",
        }
    }
}

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub resource_type: ResourceType,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        let resource_type = ResourceType::infer_from_path(url.path());
        Self {
            method,
            url,
            headers: Vec::new(),
            resource_type,
            body: Bytes::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request to `{url}` failed: {message}")]
    Transport { url: String, message: String },
    #[error("no response within {}ms", .after.as_millis())]
    Timeout { after: Duration },
}

impl FetchError {
    pub fn transport(url: &Url, message: impl Into<String>) -> Self {
        Self::Transport {
            url: url.to_string(),
            message: message.into(),
        }
    }
}

/// Network capability supplied by the host.
///
/// Any HTTP status is a successful fetch; only transport failures and
/// timeouts are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<CachedResponse, FetchError>;
}
