//! Offline response cache engine.
//!
//! Requests are resolved against a [`RoutingTable`]; the matched rule's
//! strategy runs in the [`StrategyEngine`] against a [`CacheStore`] and the
//! host's [`Fetcher`]. [`LifecycleController`] precaches and prunes
//! namespaces, and [`ControlPlane`] answers control messages.
//!
//! ## Configuration
//!
//! Rules are declared in `stowaway.toml`:
//!
//! ```toml
//! [cache]
//! version = "v1"
//!
//! [[cache.rules]]
//! name = "scripts"
//! matcher = { resource_type = "script" }
//! strategy = "stale_while_revalidate"
//! namespace = "js-cache"
//! expiration = { max_entries = 100 }
//! # ... see config.rs for all options
//! ```

mod cacheable;
mod clock;
mod config;
mod control;
mod disk;
mod error;
mod expiration;
mod keys;
mod lifecycle;
mod lock;
mod network;
mod revalidation;
mod routing;
mod store;
mod strategy;

pub use cacheable::CacheablePolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, FallbackConfig, InvalidRule, RuleConfig};
pub use control::{
    ControlError, ControlHandle, ControlMessage, ControlPlane, ControlReply, ControlRequest,
};
pub use disk::DiskStore;
pub use error::CacheError;
pub use expiration::{EvictionPlan, EvictionReport, ExpirationPolicy};
pub use keys::{CacheNamespace, RequestFingerprint};
pub use lifecycle::{
    InstallReport, LifecycleController, ManifestEntry, PrecacheManifest, WorkerPhase, WorkerState,
};
pub use network::{FetchError, Fetcher, Request, ResourceType};
#[cfg(test)]
pub(crate) use network::testing;
pub use revalidation::{RevalidationGuard, RevalidationTracker};
pub use routing::{
    Fallback, FallbackSource, Matcher, RequestPredicate, RoutingRule, RoutingTable, Strategy,
};
pub use store::{
    CacheEntry, CacheStore, CachedResponse, EntryStamp, MemoryStore, ResponseKind, StoreError,
};
pub use strategy::{
    DEFAULT_NETWORK_TIMEOUT, Intercept, ResponseSource, StrategyEngine, StrategyOutcome,
};
