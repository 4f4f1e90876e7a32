//! Message-based control RPC.
//!
//! Each `ControlMessage` carries an action and a one-shot reply port. The
//! plane answers every message, including failures, with a `ControlReply`
//! payload rather than an error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::CacheError;
use super::keys::CacheNamespace;
use super::lifecycle::LifecycleController;
use super::store::CacheStore;

const LEGACY_SKIP_WAITING: &str = "SKIP_WAITING";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ControlRequest {
    #[serde(alias = "skipWaiting")]
    ForceActivate,
    /// One namespace by storage name, or every namespace when unset.
    ClearCache {
        #[serde(default)]
        namespace: Option<String>,
    },
    /// Defaults to the plane's default namespace when unset.
    #[serde(alias = "getCacheStatus")]
    GetStatus {
        #[serde(default)]
        namespace: Option<String>,
    },
}

impl ControlRequest {
    /// Parse a wire message, accepting the bare `"SKIP_WAITING"` string and
    /// `{"type": "SKIP_WAITING"}` forms as well.
    pub fn from_json(raw: &str) -> Result<Self, ControlError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| ControlError::Malformed(err.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ControlError> {
        match &value {
            Value::String(action) if action == LEGACY_SKIP_WAITING => {
                return Ok(Self::ForceActivate);
            }
            Value::Object(map)
                if !map.contains_key("action")
                    && map.get("type").and_then(Value::as_str) == Some(LEGACY_SKIP_WAITING) =>
            {
                return Ok(Self::ForceActivate);
            }
            _ => {}
        }
        serde_json::from_value(value).map_err(|err| ControlError::Malformed(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Activated {
        activated: bool,
    },
    Cleared {
        success: bool,
    },
    Status {
        count: usize,
        fingerprints: Vec<String>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
}

impl ControlReply {
    fn failure(err: &CacheError, namespace: Option<String>) -> Self {
        Self::Error {
            error: err.to_string(),
            namespace,
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control plane is not running")]
    Closed,
    #[error("control plane dropped the reply port")]
    Dropped,
    #[error("malformed control message: {0}")]
    Malformed(String),
}

#[derive(Debug)]
pub struct ControlMessage {
    pub request: ControlRequest,
    pub reply: oneshot::Sender<ControlReply>,
}

/// Cloneable sender side of the control channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    sender: mpsc::Sender<ControlMessage>,
}

impl ControlHandle {
    pub async fn send(&self, request: ControlRequest) -> Result<ControlReply, ControlError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(ControlMessage { request, reply })
            .await
            .map_err(|_| ControlError::Closed)?;
        response.await.map_err(|_| ControlError::Dropped)
    }
}

pub struct ControlPlane {
    store: Arc<dyn CacheStore>,
    lifecycle: Arc<LifecycleController>,
    default_namespace: Option<CacheNamespace>,
}

impl ControlPlane {
    pub fn new(store: Arc<dyn CacheStore>, lifecycle: Arc<LifecycleController>) -> Self {
        Self {
            store,
            lifecycle,
            default_namespace: None,
        }
    }

    /// Namespace reported by `getStatus` without an explicit namespace.
    pub fn with_default_namespace(mut self, namespace: CacheNamespace) -> Self {
        self.default_namespace = Some(namespace);
        self
    }

    /// Start serving on a fresh channel.
    pub fn spawn(self: Arc<Self>, capacity: usize) -> (ControlHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.serve(receiver));
        (ControlHandle { sender }, task)
    }

    /// Answer messages until every handle is dropped.
    pub async fn serve(self: Arc<Self>, mut receiver: mpsc::Receiver<ControlMessage>) {
        while let Some(ControlMessage { request, reply }) = receiver.recv().await {
            let plane = Arc::clone(&self);
            tokio::spawn(async move {
                let answer = plane.dispatch(request).await;
                if reply.send(answer).is_err() {
                    debug!("Control caller went away before the reply");
                }
            });
        }
        debug!("Control channel closed");
    }

    pub async fn dispatch(&self, request: ControlRequest) -> ControlReply {
        debug!(request = ?request, "Control message received");
        match request {
            ControlRequest::ForceActivate => match self.lifecycle.force_activate().await {
                Ok(activated) => ControlReply::Activated { activated },
                Err(err) => ControlReply::failure(&err, None),
            },
            ControlRequest::ClearCache { namespace } => self.clear(namespace.as_deref()).await,
            ControlRequest::GetStatus { namespace } => self.status(namespace).await,
        }
    }

    async fn clear(&self, name: Option<&str>) -> ControlReply {
        let targets: Vec<CacheNamespace> = match name {
            Some(name) => match self.find(name).await {
                Ok(found) => found.into_iter().collect(),
                Err(err) => return ControlReply::failure(&err, Some(name.to_string())),
            },
            None => match self.store.list_namespaces().await {
                Ok(all) => all.into_iter().collect(),
                Err(err) => return ControlReply::failure(&err.into(), None),
            },
        };

        let mut success = true;
        for namespace in targets {
            match self.store.delete(&namespace).await {
                Ok(_) => info!(namespace = %namespace, "Cleared cache namespace"),
                Err(err) => {
                    warn!(namespace = %namespace, error = %err, "Failed to clear cache namespace");
                    success = false;
                }
            }
        }
        ControlReply::Cleared { success }
    }

    async fn status(&self, name: Option<String>) -> ControlReply {
        let Some(name) = name.or_else(|| {
            self.default_namespace
                .as_ref()
                .map(CacheNamespace::storage_name)
        }) else {
            return ControlReply::failure(
                &CacheError::NamespaceNotFound("<default>".to_string()),
                None,
            );
        };

        let namespace = match self.find(&name).await {
            Ok(Some(namespace)) => namespace,
            Ok(None) => {
                return ControlReply::failure(&CacheError::NamespaceNotFound(name.clone()), Some(name));
            }
            Err(err) => return ControlReply::failure(&err, Some(name)),
        };

        match self.store.keys(&namespace).await {
            Ok(keys) => ControlReply::Status {
                count: keys.len(),
                fingerprints: keys.iter().map(ToString::to_string).collect(),
            },
            Err(err) => ControlReply::failure(&err.into(), Some(name)),
        }
    }

    /// Match by storage name, then by bucket name among the live namespaces.
    async fn find(&self, name: &str) -> Result<Option<CacheNamespace>, CacheError> {
        let existing = self.store.list_namespaces().await?;
        if let Some(found) = existing.iter().find(|ns| ns.storage_name() == name) {
            return Ok(Some(found.clone()));
        }
        Ok(self
            .lifecycle
            .current_namespaces()
            .iter()
            .find(|ns| ns.name == name && existing.contains(*ns))
            .cloned())
    }
}
