//! Route registrar: bridges instance route interest to provider adapters.
//!
//! Interest is reference-counted per `(provider, topic)` and
//! `(provider, poller)`: the first interested instance triggers the
//! provider subscribe or poller start, the last one leaving triggers the
//! unsubscribe or stop. Provider calls happen before any table or interest
//! mutation, so a provider failure leaves the dispatch table unchanged and
//! surfaces as `ProviderRegisterFailed`; the caller may retry, and
//! reapplication is idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::dispatch::{DispatchTable, FilterRule, RestPollerSpec, Route};
use crate::error::{EngineError, Result};
use crate::event::EventType;
use crate::provider::{ProviderAdapter, ProviderCatalog};

/// Route interest one instance declares for a single event type, applied
/// to every provider in its registration.
#[derive(Debug, Clone)]
pub struct RouteDeclaration {
    pub event_type: EventType,
    pub ws_topics: Vec<String>,
    pub rest_pollers: Vec<RestPollerSpec>,
    pub filters: Vec<FilterRule>,
}

/// Registration request for one instance.
#[derive(Debug, Clone)]
pub struct InstanceRegistration {
    pub instance_id: String,
    pub providers: Vec<String>,
    pub routes: Vec<RouteDeclaration>,
}

type InterestKey = (String, String);

#[derive(Default)]
struct RegistrarState {
    /// (provider, topic) → interested instance ids
    topic_interest: HashMap<InterestKey, HashSet<String>>,
    /// (provider, poller name) → interested instance ids
    poller_interest: HashMap<InterestKey, HashSet<String>>,
    /// Poller specs kept for provider stop/rebuild
    pollers: HashMap<InterestKey, RestPollerSpec>,
    /// instance id → applied (provider, declaration) pairs
    instances: HashMap<String, Vec<(String, RouteDeclaration)>>,
}

struct ProviderWork {
    adapter: Arc<dyn ProviderAdapter>,
    topics: Vec<String>,
    pollers: Vec<RestPollerSpec>,
}

/// Registers and unregisters instance routes against the dispatch table
/// and the provider bridge.
pub struct RouteRegistrar {
    table: Arc<DispatchTable>,
    catalog: Arc<ProviderCatalog>,
    state: Mutex<RegistrarState>,
}

impl RouteRegistrar {
    pub fn new(table: Arc<DispatchTable>, catalog: Arc<ProviderCatalog>) -> Self {
        Self {
            table,
            catalog,
            state: Mutex::new(RegistrarState::default()),
        }
    }

    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    /// Register one instance's routes.
    pub async fn register_instance(&self, registration: InstanceRegistration) -> Result<()> {
        self.register_batch(vec![registration]).await
    }

    /// Batch registration: provider subscribe calls are grouped so each
    /// provider sees a single round-trip for the whole batch.
    pub async fn register_batch(&self, registrations: Vec<InstanceRegistration>) -> Result<()> {
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        for registration in &registrations {
            for provider in &registration.providers {
                if !adapters.contains_key(provider) {
                    adapters.insert(provider.clone(), self.catalog.get(provider)?);
                }
            }
        }

        let mut state = self.state.lock().await;

        // Plan the provider calls: only topics/pollers gaining their first
        // interested instance need a round-trip.
        let mut planned_topics: HashSet<InterestKey> = HashSet::new();
        let mut planned_pollers: HashSet<InterestKey> = HashSet::new();
        let mut work: HashMap<String, ProviderWork> = HashMap::new();
        for registration in &registrations {
            for provider in &registration.providers {
                for declaration in &registration.routes {
                    for topic in &declaration.ws_topics {
                        let key = (provider.clone(), topic.clone());
                        let active = state
                            .topic_interest
                            .get(&key)
                            .map(|s| !s.is_empty())
                            .unwrap_or(false);
                        if !active && planned_topics.insert(key) {
                            work.entry(provider.clone())
                                .or_insert_with(|| ProviderWork {
                                    adapter: Arc::clone(&adapters[provider]),
                                    topics: Vec::new(),
                                    pollers: Vec::new(),
                                })
                                .topics
                                .push(topic.clone());
                        }
                    }
                    for poller in &declaration.rest_pollers {
                        let key = (provider.clone(), poller.name.clone());
                        let active = state
                            .poller_interest
                            .get(&key)
                            .map(|s| !s.is_empty())
                            .unwrap_or(false);
                        if !active && planned_pollers.insert(key) {
                            work.entry(provider.clone())
                                .or_insert_with(|| ProviderWork {
                                    adapter: Arc::clone(&adapters[provider]),
                                    topics: Vec::new(),
                                    pollers: Vec::new(),
                                })
                                .pollers
                                .push(poller.clone());
                        }
                    }
                }
            }
        }

        // Provider round-trips first; rollback everything applied so far on
        // the first failure so the table is never left half-registered.
        let mut applied: Vec<ProviderWork> = Vec::new();
        for (provider, unit) in work {
            if !unit.topics.is_empty() {
                if let Err(err) = unit.adapter.subscribe(&unit.topics).await {
                    self.rollback_register(&applied).await;
                    return Err(EngineError::ProviderRegisterFailed {
                        provider,
                        message: err.to_string(),
                    });
                }
            }
            let mut started: Vec<RestPollerSpec> = Vec::new();
            for poller in &unit.pollers {
                if let Err(err) = unit.adapter.start_poller(poller).await {
                    let partial = ProviderWork {
                        adapter: Arc::clone(&unit.adapter),
                        topics: unit.topics.clone(),
                        pollers: started,
                    };
                    applied.push(partial);
                    self.rollback_register(&applied).await;
                    return Err(EngineError::ProviderRegisterFailed {
                        provider,
                        message: err.to_string(),
                    });
                }
                started.push(poller.clone());
            }
            applied.push(ProviderWork {
                adapter: unit.adapter,
                topics: unit.topics,
                pollers: started,
            });
        }

        // Commit interest, declarations, bindings, and rebuilt routes.
        let mut affected: HashSet<(String, EventType)> = HashSet::new();
        for registration in registrations {
            let previous = state.instances.remove(&registration.instance_id);
            if let Some(previous) = previous {
                Self::retract(&mut state, &registration.instance_id, &previous, &mut affected);
            }
            let mut pairs = Vec::new();
            for provider in &registration.providers {
                for declaration in &registration.routes {
                    for topic in &declaration.ws_topics {
                        state
                            .topic_interest
                            .entry((provider.clone(), topic.clone()))
                            .or_default()
                            .insert(registration.instance_id.clone());
                    }
                    for poller in &declaration.rest_pollers {
                        let key = (provider.clone(), poller.name.clone());
                        state
                            .poller_interest
                            .entry(key.clone())
                            .or_default()
                            .insert(registration.instance_id.clone());
                        state.pollers.insert(key, poller.clone());
                    }
                    self.table.bind_instance(
                        &registration.instance_id,
                        provider,
                        declaration.event_type,
                        declaration.filters.clone(),
                    )?;
                    affected.insert((provider.clone(), declaration.event_type));
                    pairs.push((provider.clone(), declaration.clone()));
                }
            }
            state.instances.insert(registration.instance_id, pairs);
        }
        for key in affected {
            self.rebuild_route(&state, &key)?;
        }
        Ok(())
    }

    /// Remove an instance from every interest set, instructing providers to
    /// unsubscribe topics and stop pollers that lost their last instance.
    /// Unknown instances are a no-op.
    pub async fn unregister_instance(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(declarations) = state.instances.get(instance_id).cloned() else {
            return Ok(());
        };

        // Plan the releases: keys where this instance is the only interest.
        let mut work: HashMap<String, ProviderWork> = HashMap::new();
        for (provider, declaration) in &declarations {
            for topic in &declaration.ws_topics {
                let key = (provider.clone(), topic.clone());
                let sole = state
                    .topic_interest
                    .get(&key)
                    .map(|s| s.len() == 1 && s.contains(instance_id))
                    .unwrap_or(false);
                if sole {
                    let adapter = self.catalog.get(provider)?;
                    let unit = work.entry(provider.clone()).or_insert_with(|| ProviderWork {
                        adapter,
                        topics: Vec::new(),
                        pollers: Vec::new(),
                    });
                    if !unit.topics.contains(topic) {
                        unit.topics.push(topic.clone());
                    }
                }
            }
            for poller in &declaration.rest_pollers {
                let key = (provider.clone(), poller.name.clone());
                let sole = state
                    .poller_interest
                    .get(&key)
                    .map(|s| s.len() == 1 && s.contains(instance_id))
                    .unwrap_or(false);
                if sole {
                    let adapter = self.catalog.get(provider)?;
                    let unit = work.entry(provider.clone()).or_insert_with(|| ProviderWork {
                        adapter,
                        topics: Vec::new(),
                        pollers: Vec::new(),
                    });
                    if !unit.pollers.iter().any(|p| p.name == poller.name) {
                        unit.pollers.push(poller.clone());
                    }
                }
            }
        }

        let mut applied: Vec<ProviderWork> = Vec::new();
        for (provider, unit) in work {
            if !unit.topics.is_empty() {
                if let Err(err) = unit.adapter.unsubscribe(&unit.topics).await {
                    self.rollback_unregister(&applied).await;
                    return Err(EngineError::ProviderRegisterFailed {
                        provider,
                        message: err.to_string(),
                    });
                }
            }
            let mut stopped: Vec<RestPollerSpec> = Vec::new();
            for poller in &unit.pollers {
                if let Err(err) = unit.adapter.stop_poller(&poller.name).await {
                    let partial = ProviderWork {
                        adapter: Arc::clone(&unit.adapter),
                        topics: unit.topics.clone(),
                        pollers: stopped,
                    };
                    applied.push(partial);
                    self.rollback_unregister(&applied).await;
                    return Err(EngineError::ProviderRegisterFailed {
                        provider,
                        message: err.to_string(),
                    });
                }
                stopped.push(poller.clone());
            }
            applied.push(ProviderWork {
                adapter: unit.adapter,
                topics: unit.topics,
                pollers: stopped,
            });
        }

        // Commit.
        let mut affected: HashSet<(String, EventType)> = HashSet::new();
        state.instances.remove(instance_id);
        Self::retract(&mut state, instance_id, &declarations, &mut affected);
        self.table.unbind_instance(instance_id);
        for key in affected {
            self.rebuild_route(&state, &key)?;
        }
        Ok(())
    }

    /// Remove an instance from the interest sets of its declarations.
    fn retract(
        state: &mut RegistrarState,
        instance_id: &str,
        declarations: &[(String, RouteDeclaration)],
        affected: &mut HashSet<(String, EventType)>,
    ) {
        for (provider, declaration) in declarations {
            for topic in &declaration.ws_topics {
                let key = (provider.clone(), topic.clone());
                if let Some(set) = state.topic_interest.get_mut(&key) {
                    set.remove(instance_id);
                    if set.is_empty() {
                        state.topic_interest.remove(&key);
                    }
                }
            }
            for poller in &declaration.rest_pollers {
                let key = (provider.clone(), poller.name.clone());
                if let Some(set) = state.poller_interest.get_mut(&key) {
                    set.remove(instance_id);
                    if set.is_empty() {
                        state.poller_interest.remove(&key);
                        state.pollers.remove(&key);
                    }
                }
            }
            affected.insert((provider.clone(), declaration.event_type));
        }
    }

    /// Rebuild the merged route for one `(provider, type)` key from every
    /// remaining declaration, or drop it when none remain.
    fn rebuild_route(&self, state: &RegistrarState, key: &(String, EventType)) -> Result<()> {
        let mut topics: Vec<String> = Vec::new();
        let mut pollers: Vec<RestPollerSpec> = Vec::new();
        for pairs in state.instances.values() {
            for (provider, declaration) in pairs {
                if provider != &key.0 || declaration.event_type != key.1 {
                    continue;
                }
                for topic in &declaration.ws_topics {
                    if !topics.contains(topic) {
                        topics.push(topic.clone());
                    }
                }
                for poller in &declaration.rest_pollers {
                    if !pollers.iter().any(|p| p.name == poller.name) {
                        pollers.push(poller.clone());
                    }
                }
            }
        }
        if topics.is_empty() && pollers.is_empty() {
            self.table.remove(&key.0, key.1);
        } else {
            topics.sort();
            self.table.upsert(Route {
                provider: key.0.clone(),
                event_type: key.1,
                ws_topics: topics,
                rest_pollers: pollers,
                filters: Vec::new(),
            })?;
        }
        Ok(())
    }

    /// Undo provider subscribes/poller starts after a partial failure.
    async fn rollback_register(&self, applied: &[ProviderWork]) {
        for unit in applied {
            if !unit.topics.is_empty() {
                if let Err(err) = unit.adapter.unsubscribe(&unit.topics).await {
                    warn!(provider = unit.adapter.name(), error = %err, "rollback unsubscribe failed");
                }
            }
            for poller in &unit.pollers {
                if let Err(err) = unit.adapter.stop_poller(&poller.name).await {
                    warn!(provider = unit.adapter.name(), poller = %poller.name, error = %err, "rollback poller stop failed");
                }
            }
        }
    }

    /// Undo provider unsubscribes/poller stops after a partial failure.
    async fn rollback_unregister(&self, applied: &[ProviderWork]) {
        for unit in applied {
            if !unit.topics.is_empty() {
                if let Err(err) = unit.adapter.subscribe(&unit.topics).await {
                    warn!(provider = unit.adapter.name(), error = %err, "rollback resubscribe failed");
                }
            }
            for poller in &unit.pollers {
                if let Err(err) = unit.adapter.start_poller(poller).await {
                    warn!(provider = unit.adapter.name(), poller = %poller.name, error = %err, "rollback poller restart failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    /// Recording fake: counts calls and optionally fails subscribes.
    struct FakeProvider {
        name: String,
        subscribes: AtomicUsize,
        unsubscribes: AtomicUsize,
        fail_subscribe: bool,
    }

    impl FakeProvider {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                subscribes: AtomicUsize::new(0),
                unsubscribes: AtomicUsize::new(0),
                fail_subscribe: false,
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                subscribes: AtomicUsize::new(0),
                unsubscribes: AtomicUsize::new(0),
                fail_subscribe: true,
            })
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn subscribe(&self, _topics: &[String]) -> Result<()> {
            if self.fail_subscribe {
                return Err(EngineError::RuntimeError {
                    message: "ws closed".to_string(),
                });
            }
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unsubscribe(&self, _topics: &[String]) -> Result<()> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn start_poller(&self, _poller: &RestPollerSpec) -> Result<()> {
            Ok(())
        }

        async fn stop_poller(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn declaration(symbol: &str) -> RouteDeclaration {
        RouteDeclaration {
            event_type: EventType::Ticker,
            ws_topics: vec![Route::market_topic(EventType::Ticker, symbol)],
            rest_pollers: vec![],
            filters: vec![],
        }
    }

    fn registration(instance: &str, provider: &str, symbol: &str) -> InstanceRegistration {
        InstanceRegistration {
            instance_id: instance.to_string(),
            providers: vec![provider.to_string()],
            routes: vec![declaration(symbol)],
        }
    }

    fn registrar_with(provider: Arc<FakeProvider>) -> RouteRegistrar {
        let catalog = Arc::new(ProviderCatalog::new());
        catalog.register(provider);
        RouteRegistrar::new(Arc::new(DispatchTable::new()), catalog)
    }

    #[tokio::test]
    async fn test_first_instance_triggers_subscribe_second_does_not() {
        let provider = FakeProvider::new("okx-spot");
        let registrar = registrar_with(Arc::clone(&provider));

        registrar
            .register_instance(registration("alpha", "okx-spot", "BTC-USDT"))
            .await
            .unwrap();
        assert_eq!(provider.subscribes.load(Ordering::SeqCst), 1);

        registrar
            .register_instance(registration("beta", "okx-spot", "BTC-USDT"))
            .await
            .unwrap();
        // Same topic already active: no extra provider round-trip.
        assert_eq!(provider.subscribes.load(Ordering::SeqCst), 1);

        let route = registrar
            .table()
            .lookup("okx-spot", EventType::Ticker)
            .unwrap();
        assert_eq!(route.ws_topics, vec!["ticker:BTC-USDT".to_string()]);
    }

    #[tokio::test]
    async fn test_last_instance_out_triggers_unsubscribe() {
        let provider = FakeProvider::new("okx-spot");
        let registrar = registrar_with(Arc::clone(&provider));

        registrar
            .register_instance(registration("alpha", "okx-spot", "BTC-USDT"))
            .await
            .unwrap();
        registrar
            .register_instance(registration("beta", "okx-spot", "BTC-USDT"))
            .await
            .unwrap();

        registrar.unregister_instance("alpha").await.unwrap();
        assert_eq!(provider.unsubscribes.load(Ordering::SeqCst), 0);

        registrar.unregister_instance("beta").await.unwrap();
        assert_eq!(provider.unsubscribes.load(Ordering::SeqCst), 1);
        assert!(registrar
            .table()
            .lookup("okx-spot", EventType::Ticker)
            .is_none());
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_table_unchanged() {
        let provider = FakeProvider::failing("okx-spot");
        let registrar = registrar_with(provider);

        let err = registrar
            .register_instance(registration("alpha", "okx-spot", "BTC-USDT"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProviderRegisterFailed { .. }));
        assert!(registrar
            .table()
            .lookup("okx-spot", EventType::Ticker)
            .is_none());
        assert_eq!(registrar.table().version(), 0);
    }

    #[tokio::test]
    async fn test_unregister_unknown_instance_is_noop() {
        let provider = FakeProvider::new("okx-spot");
        let registrar = registrar_with(provider);
        registrar.unregister_instance("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_registers_topics_in_one_round_trip() {
        let provider = FakeProvider::new("okx-spot");
        let registrar = registrar_with(Arc::clone(&provider));

        registrar
            .register_batch(vec![
                registration("alpha", "okx-spot", "BTC-USDT"),
                registration("beta", "okx-spot", "ETH-USDT"),
            ])
            .await
            .unwrap();
        assert_eq!(provider.subscribes.load(Ordering::SeqCst), 1);

        let route = registrar
            .table()
            .lookup("okx-spot", EventType::Ticker)
            .unwrap();
        assert_eq!(route.ws_topics.len(), 2);
    }
}
