//! Provider adapter and order-router seams.
//!
//! Exchange adapters (WS/REST) live outside this crate; the engine talks to
//! them through these traits. Register/unregister calls are best-effort and
//! retriable: a failure leaves engine state unchanged and reapplication is
//! idempotent on the adapter side.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::dispatch::RestPollerSpec;
use crate::error::{EngineError, Result};
use crate::event::OrderRequest;

/// Bridge to one exchange provider's subscription surface.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Catalog name, e.g. `okx-spot`.
    fn name(&self) -> &str;

    /// Subscribe to WS topics. Called once per newly interesting topic set.
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Unsubscribe WS topics whose interest set became empty.
    async fn unsubscribe(&self, topics: &[String]) -> Result<()>;

    /// Start a REST poller. Idempotent for an already-running poller.
    async fn start_poller(&self, poller: &RestPollerSpec) -> Result<()>;

    /// Stop a REST poller by name. Idempotent for a stopped poller.
    async fn stop_poller(&self, name: &str) -> Result<()>;
}

/// Routes validated orders to the owning provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRouter: Send + Sync {
    async fn route_order(&self, request: &OrderRequest) -> Result<()>;
}

/// Catalog of available provider adapters, keyed by name.
#[derive(Default)]
pub struct ProviderCatalog {
    providers: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any prior adapter of the same name.
    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        providers.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>> {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        providers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ProviderUnavailable {
                provider: name.to_string(),
            })
    }

    /// Resolve every name or fail on the first unavailable provider.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn ProviderAdapter>>> {
        names.iter().map(|name| self.get(name)).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        providers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = providers.keys().cloned().collect();
        names.sort();
        names
    }
}
