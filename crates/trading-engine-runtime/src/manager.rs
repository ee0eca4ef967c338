//! # Strategy Manager
//!
//! Orchestrates the distribution core, the dispatch registrar, and the
//! module registry: instance create/start/stop/update/remove, spec
//! immutability, revision usage and the in-use guards, and targeted
//! registry refresh with bounded restart blast radius.
//!
//! Locking discipline: the manager's lock covers the instance table and
//! the usage ledger only, and is never held across supervisor start/stop
//! or a provider round-trip. An instance transitions through a `Starting`
//! / `Stopping` guard state while the lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trading_engine_core::bus::EventBus;
use trading_engine_core::dispatch::{FilterRule, InstanceRegistration, Route, RouteDeclaration, RouteRegistrar};
use trading_engine_core::error::{EngineError, Result};
use trading_engine_core::event::SubscriptionClass;
use trading_engine_core::provider::{OrderRouter, ProviderCatalog};
use trading_engine_registry::store::DeleteOutcome;
use trading_engine_registry::{ModuleStore, Resolution, Selector, StoredModule};

use crate::handler::{StrategyEnv, StrategyFactory, StrategyHandler};
use crate::risk::RiskManager;
use crate::spec::InstanceSpec;
use crate::strategies;
use crate::supervisor::{Supervisor, SupervisorCore};
use crate::usage::{RevisionUsage, UsageTracker};

/// Builds handlers for dynamically loaded modules. The real module runtime
/// lives outside this crate; [`EchoModuleHandlerFactory`] is the built-in
/// reference that logs observed events per the module's metadata.
pub trait ModuleHandlerFactory: Send + Sync {
    fn build(&self, module: &StoredModule, env: StrategyEnv) -> Result<Arc<dyn StrategyHandler>>;
}

/// Reference module-handler factory: a logging handler honoring the
/// module's cross-provider declaration.
pub struct EchoModuleHandlerFactory;

struct EchoModuleHandler {
    name: String,
    wants_cross: bool,
}

#[async_trait::async_trait]
impl StrategyHandler for EchoModuleHandler {
    async fn on_trade(&self, event: &trading_engine_core::event::Event) -> Result<()> {
        info!(target: "strategy::module", module = %self.name, provider = %event.provider, symbol = %event.symbol, "trade observed");
        Ok(())
    }

    fn wants_cross_provider_events(&self) -> bool {
        self.wants_cross
    }
}

impl ModuleHandlerFactory for EchoModuleHandlerFactory {
    fn build(&self, module: &StoredModule, _env: StrategyEnv) -> Result<Arc<dyn StrategyHandler>> {
        Ok(Arc::new(EchoModuleHandler {
            name: module.name.clone(),
            wants_cross: module.module.wants_cross_provider_events,
        }))
    }
}

/// Refresh targeting: an empty target set refreshes everything.
#[derive(Debug, Clone, Default)]
pub struct RefreshTargets {
    pub strategies: Vec<String>,
    pub hashes: Vec<String>,
}

impl RefreshTargets {
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty() && self.hashes.is_empty()
    }

    fn matches(&self, name: &str, hash: &str) -> bool {
        self.is_empty()
            || self.strategies.iter().any(|s| s == name)
            || self.hashes.iter().any(|h| h == hash)
    }
}

/// Per-revision outcome of a targeted refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RefreshReason {
    /// Pin moved to a new hash; affected instances were restarted
    Refreshed,
    /// Selector still resolves to the pinned hash; nothing to do
    AlreadyPinned,
    /// Selector no longer resolves; affected instances were stopped
    Retired,
}

/// One entry of the refresh report.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub selector: String,
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub instances: Vec<String>,
    pub reason: RefreshReason,
}

/// Control-plane view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub strategy: String,
    pub selector: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub running: bool,
    pub providers: Vec<String>,
    pub symbols: Vec<String>,
    pub order_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price: Option<f64>,
    pub config: serde_json::Map<String, serde_json::Value>,
}

struct RunningInstance {
    supervisor: Supervisor,
    handler: Arc<dyn StrategyHandler>,
    resolution: Option<Resolution>,
    error_task: JoinHandle<()>,
}

enum Lifecycle {
    Stopped,
    Starting,
    Running(RunningInstance),
    Stopping,
}

impl Lifecycle {
    fn is_running(&self) -> bool {
        matches!(self, Lifecycle::Running(_) | Lifecycle::Starting)
    }
}

struct InstanceRecord {
    spec: InstanceSpec,
    dynamic: bool,
    revision: Option<Resolution>,
    lifecycle: Lifecycle,
}

#[derive(Default)]
struct ManagerState {
    instances: HashMap<String, InstanceRecord>,
    usage: UsageTracker,
}

/// The orchestrator.
pub struct StrategyManager {
    bus: EventBus,
    registrar: Arc<RouteRegistrar>,
    catalog: Arc<ProviderCatalog>,
    risk: Arc<dyn RiskManager>,
    router: Arc<dyn OrderRouter>,
    registry: Option<Arc<ModuleStore>>,
    module_factory: Arc<dyn ModuleHandlerFactory>,
    static_factories: RwLock<HashMap<String, Arc<dyn StrategyFactory>>>,
    state: Mutex<ManagerState>,
}

impl StrategyManager {
    pub fn new(
        bus: EventBus,
        registrar: Arc<RouteRegistrar>,
        catalog: Arc<ProviderCatalog>,
        risk: Arc<dyn RiskManager>,
        router: Arc<dyn OrderRouter>,
    ) -> Self {
        let mut factories: HashMap<String, Arc<dyn StrategyFactory>> = HashMap::new();
        for factory in strategies::builtin_factories() {
            factories.insert(factory.identifier().to_string(), factory);
        }
        Self {
            bus,
            registrar,
            catalog,
            risk,
            router,
            registry: None,
            module_factory: Arc::new(EchoModuleHandlerFactory),
            static_factories: RwLock::new(factories),
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Attach the dynamic module registry.
    pub fn with_registry(mut self, registry: Arc<ModuleStore>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the dynamic module handler factory.
    pub fn with_module_factory(mut self, factory: Arc<dyn ModuleHandlerFactory>) -> Self {
        self.module_factory = factory;
        self
    }

    /// Register (or replace) a static strategy factory.
    pub fn register_static_factory(&self, factory: Arc<dyn StrategyFactory>) {
        let mut factories = self
            .static_factories
            .write()
            .unwrap_or_else(|e| e.into_inner());
        factories.insert(factory.identifier().to_string(), factory);
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Validate, normalize, resolve, and register a new instance as
    /// stopped.
    pub async fn create(&self, mut spec: InstanceSpec) -> Result<InstanceSnapshot> {
        spec.normalize();
        spec.validate()?;
        let (dynamic, revision) = self.resolve_spec(&spec)?;
        if let Some(resolution) = &revision {
            spec.strategy.identifier = resolution.name.clone();
        }

        let mut state = self.state.lock().await;
        if state.instances.contains_key(&spec.id) {
            return Err(EngineError::InstanceExists { id: spec.id });
        }
        let id = spec.id.clone();
        let record = InstanceRecord {
            spec,
            dynamic,
            revision,
            lifecycle: Lifecycle::Stopped,
        };
        let snapshot = Self::snapshot_record(&record);
        state.instances.insert(id.clone(), record);
        info!(instance = %id, "instance created");
        Ok(snapshot)
    }

    /// Start a stopped instance: resolve providers, build the handler,
    /// register routes, and spin up the supervisor.
    pub async fn start(&self, id: &str) -> Result<()> {
        let (spec, dynamic) = {
            let mut state = self.state.lock().await;
            let record =
                state
                    .instances
                    .get_mut(id)
                    .ok_or_else(|| EngineError::InstanceNotFound {
                        id: id.to_string(),
                    })?;
            if record.lifecycle.is_running() {
                return Err(EngineError::InstanceAlreadyRunning { id: id.to_string() });
            }
            record.lifecycle = Lifecycle::Starting;
            (record.spec.clone(), record.dynamic)
        };

        match self.start_inner(&spec, dynamic).await {
            Ok((running, resolution)) => {
                let mut state = self.state.lock().await;
                if let Some(resolution) = &resolution {
                    state.usage.record(&resolution.name, &resolution.hash, id);
                }
                if let Some(record) = state.instances.get_mut(id) {
                    record.revision = resolution;
                    record.lifecycle = Lifecycle::Running(running);
                }
                info!(instance = %id, "instance started");
                Ok(())
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                if let Some(record) = state.instances.get_mut(id) {
                    record.lifecycle = Lifecycle::Stopped;
                }
                Err(err)
            }
        }
    }

    async fn start_inner(
        &self,
        spec: &InstanceSpec,
        dynamic: bool,
    ) -> Result<(RunningInstance, Option<Resolution>)> {
        // Fail fast on unavailable providers before touching anything.
        self.catalog.resolve(&spec.providers)?;

        let core = SupervisorCore::new(
            spec,
            self.bus.clone(),
            Arc::clone(&self.risk),
            Arc::clone(&self.router),
        );

        let (handler, subscribed, wants_cross, resolution) = if dynamic {
            let registry = self.require_registry()?;
            let resolved = registry.resolve(&spec.strategy.selector_string())?;
            let mut config = spec.strategy.config.clone();
            resolved.module.module.metadata.apply_defaults(&mut config);
            let env = StrategyEnv {
                instance_id: spec.id.clone(),
                config,
                runtime: core.clone(),
            };
            let handler = self.module_factory.build(&resolved.module, env)?;
            let wants_cross = handler.wants_cross_provider_events()
                || resolved.module.module.wants_cross_provider_events;
            (
                handler,
                resolved.module.module.subscribed_events.clone(),
                wants_cross,
                Some(resolved.resolution),
            )
        } else {
            let factory = {
                let factories = self
                    .static_factories
                    .read()
                    .unwrap_or_else(|e| e.into_inner());
                factories
                    .get(&spec.strategy.identifier)
                    .cloned()
                    .ok_or_else(|| EngineError::ModuleNotFound {
                        selector: spec.strategy.identifier.clone(),
                    })?
            };
            let env = StrategyEnv {
                instance_id: spec.id.clone(),
                config: spec.strategy.config.clone(),
                runtime: core.clone(),
            };
            let handler = factory.build(env)?;
            let wants_cross = handler.wants_cross_provider_events();
            (handler, factory.subscribed_events(), wants_cross, None)
        };

        if spec.providers.len() > 1 && !wants_cross {
            return Err(EngineError::InvalidSpec {
                message: format!(
                    "strategy {:?} does not accept cross-provider events",
                    spec.strategy.identifier
                ),
            });
        }

        // Market-data route declarations: type × configured symbols.
        let symbols = spec.all_symbols();
        let routes: Vec<RouteDeclaration> = subscribed
            .iter()
            .filter(|event_type| event_type.class() == SubscriptionClass::MarketData)
            .map(|event_type| RouteDeclaration {
                event_type: *event_type,
                ws_topics: symbols
                    .iter()
                    .map(|symbol| Route::market_topic(*event_type, symbol))
                    .collect(),
                rest_pollers: Vec::new(),
                filters: if symbols.is_empty() {
                    Vec::new()
                } else {
                    vec![FilterRule::one_of(
                        "instrument",
                        symbols.iter().map(|s| serde_json::json!(s)).collect(),
                    )]
                },
            })
            .collect();

        self.registrar
            .register_instance(InstanceRegistration {
                instance_id: spec.id.clone(),
                providers: spec.providers.clone(),
                routes,
            })
            .await?;

        let cancel = CancellationToken::new();
        let (supervisor, mut error_rx) =
            match Supervisor::start(Arc::clone(&core), Arc::clone(&handler), &subscribed, cancel)
            {
                Ok(started) => started,
                Err(err) => {
                    if let Err(unregister_err) =
                        self.registrar.unregister_instance(&spec.id).await
                    {
                        warn!(instance = %spec.id, error = %unregister_err, "route unregister after failed start");
                    }
                    return Err(err);
                }
            };

        let instance_id = spec.id.clone();
        let error_task = tokio::spawn(async move {
            while let Some(err) = error_rx.recv().await {
                warn!(instance = %instance_id, error = %err, "supervisor background error");
            }
        });

        Ok((
            RunningInstance {
                supervisor,
                handler,
                resolution: resolution.clone(),
                error_task,
            },
            resolution,
        ))
    }

    /// Stop a running instance: cancel the supervisor, unregister routes,
    /// close the handler, release the revision pin.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let running = {
            let mut state = self.state.lock().await;
            let record =
                state
                    .instances
                    .get_mut(id)
                    .ok_or_else(|| EngineError::InstanceNotFound {
                        id: id.to_string(),
                    })?;
            match std::mem::replace(&mut record.lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running(running) => running,
                other => {
                    record.lifecycle = other;
                    return Err(EngineError::InstanceNotRunning { id: id.to_string() });
                }
            }
        };

        running.supervisor.cancel();
        running.supervisor.join().await;
        if let Err(err) = running.handler.close().await {
            warn!(instance = %id, error = %err, "handler close failed");
        }
        if let Err(err) = self.registrar.unregister_instance(id).await {
            warn!(instance = %id, error = %err, "route unregister failed");
        }
        running.error_task.abort();

        let mut state = self.state.lock().await;
        if let Some(resolution) = &running.resolution {
            state.usage.release(&resolution.name, &resolution.hash, id);
        }
        if let Some(record) = state.instances.get_mut(id) {
            record.lifecycle = Lifecycle::Stopped;
        }
        info!(instance = %id, "instance stopped");
        Ok(())
    }

    /// Remove an instance, stopping it first when running.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let running = {
            let state = self.state.lock().await;
            let record = state
                .instances
                .get(id)
                .ok_or_else(|| EngineError::InstanceNotFound {
                    id: id.to_string(),
                })?;
            record.lifecycle.is_running()
        };
        if running {
            self.stop(id).await?;
        }
        let mut state = self.state.lock().await;
        state.instances.remove(id);
        info!(instance = %id, "instance removed");
        Ok(())
    }

    /// Update an instance spec. `providers`, `provider_symbols`, and the
    /// strategy identifier are immutable; config and selector-derived
    /// tag/hash may change. A running instance is stopped and restarted.
    pub async fn update(&self, mut spec: InstanceSpec) -> Result<InstanceSnapshot> {
        spec.normalize();
        spec.validate()?;
        let (dynamic, revision) = self.resolve_spec(&spec)?;

        let was_running = {
            let state = self.state.lock().await;
            let record =
                state
                    .instances
                    .get(&spec.id)
                    .ok_or_else(|| EngineError::InstanceNotFound {
                        id: spec.id.clone(),
                    })?;
            record.spec.ensure_update_compatible(&spec)?;
            record.lifecycle.is_running()
        };

        if was_running {
            self.stop(&spec.id).await?;
        }

        let id = spec.id.clone();
        let snapshot = {
            let mut state = self.state.lock().await;
            let record =
                state
                    .instances
                    .get_mut(&id)
                    .ok_or_else(|| EngineError::InstanceNotFound { id: id.clone() })?;
            record.spec = spec;
            record.dynamic = dynamic;
            record.revision = revision;
            Self::snapshot_record(record)
        };

        if was_running {
            self.start(&id).await?;
        }
        Ok(snapshot)
    }

    /// The revision-in-use guard, then registry deletion. A hash-qualified
    /// selector is rejected while any instance pins the hash; a name or
    /// tag selector is rejected while any instance of the strategy runs.
    pub async fn remove_strategy(&self, selector: &str) -> Result<DeleteOutcome> {
        let registry = self.require_registry()?;
        let parsed = Selector::parse(selector)?;
        let resolved = registry.resolve(selector)?;

        {
            let state = self.state.lock().await;
            let blocking = match &parsed {
                Selector::NameHash { .. } | Selector::Hash(_) => state
                    .usage
                    .instances_pinning(&resolved.resolution.name, &resolved.resolution.hash),
                Selector::Name(_) | Selector::NameTag { .. } => {
                    state.usage.instances_using(&resolved.resolution.name)
                }
            };
            if !blocking.is_empty() {
                return Err(EngineError::RevisionInUse {
                    selector: resolved.resolution.selector.clone(),
                    instances: blocking,
                });
            }
        }

        registry.delete(selector)
    }

    /// Reinstall the registry, then re-resolve every pinned instance
    /// matching the targets: a moved hash restarts the instance, a
    /// vanished selector stops it. Targets that no longer resolve appear
    /// as retired entries with no instances.
    pub async fn refresh_strategies_with_targets(
        &self,
        targets: RefreshTargets,
    ) -> Result<Vec<RefreshOutcome>> {
        let registry = self.require_registry()?;
        registry.refresh()?;

        enum Plan {
            Restart(String),
            Stop(String),
        }

        let mut outcomes: Vec<RefreshOutcome> = Vec::new();
        let mut plans: Vec<Plan> = Vec::new();
        {
            let state = self.state.lock().await;
            for (id, record) in &state.instances {
                let Some(pinned) = &record.revision else {
                    continue;
                };
                if !targets.matches(&pinned.name, &pinned.hash) {
                    continue;
                }
                let selector = record.spec.strategy.selector_string();
                match registry.resolve(&selector) {
                    Ok(resolved) if resolved.resolution.hash == pinned.hash => {
                        push_outcome(
                            &mut outcomes,
                            RefreshOutcome {
                                selector: resolved.resolution.selector,
                                strategy: pinned.name.clone(),
                                hash: Some(pinned.hash.clone()),
                                previous_hash: Some(pinned.hash.clone()),
                                instances: vec![id.clone()],
                                reason: RefreshReason::AlreadyPinned,
                            },
                        );
                    }
                    Ok(resolved) => {
                        plans.push(Plan::Restart(id.clone()));
                        push_outcome(
                            &mut outcomes,
                            RefreshOutcome {
                                selector: resolved.resolution.selector,
                                strategy: resolved.resolution.name,
                                hash: Some(resolved.resolution.hash),
                                previous_hash: Some(pinned.hash.clone()),
                                instances: vec![id.clone()],
                                reason: RefreshReason::Refreshed,
                            },
                        );
                    }
                    Err(_) => {
                        plans.push(Plan::Stop(id.clone()));
                        push_outcome(
                            &mut outcomes,
                            RefreshOutcome {
                                selector,
                                strategy: pinned.name.clone(),
                                hash: None,
                                previous_hash: Some(pinned.hash.clone()),
                                instances: vec![id.clone()],
                                reason: RefreshReason::Retired,
                            },
                        );
                    }
                }
            }
        }

        // Targets with no surviving module and no instances: retired.
        for name in &targets.strategies {
            let known = outcomes.iter().any(|o| &o.strategy == name);
            if !known && !registry.contains_name(name) {
                outcomes.push(RefreshOutcome {
                    selector: name.clone(),
                    strategy: name.clone(),
                    hash: None,
                    previous_hash: None,
                    instances: Vec::new(),
                    reason: RefreshReason::Retired,
                });
            }
        }

        for plan in plans {
            match plan {
                Plan::Restart(id) => {
                    let was_running = self.is_running(&id).await;
                    // Re-pin the record to the refreshed resolution.
                    {
                        let mut state = self.state.lock().await;
                        if let Some(record) = state.instances.get_mut(&id) {
                            let selector = record.spec.strategy.selector_string();
                            if let Ok(resolved) = registry.resolve(&selector) {
                                record.revision = Some(resolved.resolution);
                            }
                        }
                    }
                    if was_running {
                        if let Err(err) = self.stop(&id).await {
                            warn!(instance = %id, error = %err, "refresh stop failed");
                            continue;
                        }
                        if let Err(err) = self.start(&id).await {
                            warn!(instance = %id, error = %err, "refresh restart failed");
                        }
                    }
                }
                Plan::Stop(id) => {
                    if self.is_running(&id).await {
                        if let Err(err) = self.stop(&id).await {
                            warn!(instance = %id, error = %err, "refresh stop failed");
                        }
                    }
                }
            }
        }

        outcomes.sort_by(|a, b| a.strategy.cmp(&b.strategy).then(a.selector.cmp(&b.selector)));
        Ok(outcomes)
    }

    /// Copy-on-read control-plane snapshot of every instance.
    pub async fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let state = self.state.lock().await;
        let mut snapshots: Vec<InstanceSnapshot> = state
            .instances
            .values()
            .map(Self::snapshot_record)
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Copy-on-read snapshot of the revision usage ledger.
    pub async fn usage_snapshot(&self) -> Vec<RevisionUsage> {
        let state = self.state.lock().await;
        state.usage.snapshot()
    }

    async fn is_running(&self, id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .instances
            .get(id)
            .map(|record| record.lifecycle.is_running())
            .unwrap_or(false)
    }

    fn snapshot_record(record: &InstanceRecord) -> InstanceSnapshot {
        let (order_count, last_price) = match &record.lifecycle {
            Lifecycle::Running(running) => {
                let core = running.supervisor.core();
                (core.order_count(), {
                    use crate::handler::StrategyRuntime;
                    core.last_price()
                })
            }
            _ => (0, None),
        };
        InstanceSnapshot {
            id: record.spec.id.clone(),
            strategy: record.spec.strategy.identifier.clone(),
            selector: record.spec.strategy.selector_string(),
            hash: record.revision.as_ref().map(|r| r.hash.clone()),
            tag: record
                .revision
                .as_ref()
                .map(|r| r.tag.clone())
                .filter(|tag| !tag.is_empty()),
            running: record.lifecycle.is_running(),
            providers: record.spec.providers.clone(),
            symbols: record.spec.all_symbols(),
            order_count,
            last_price,
            config: record.spec.strategy.config.clone(),
        }
    }

    fn require_registry(&self) -> Result<&Arc<ModuleStore>> {
        self.registry
            .as_ref()
            .ok_or_else(|| EngineError::RegistryUnavailable {
                message: "no dynamic module registry configured".to_string(),
            })
    }

    /// Selector routing per the create contract: qualified selectors and
    /// names of dynamically loaded modules go through the resolver; bare
    /// names fall back to the static strategy table.
    fn resolve_spec(&self, spec: &InstanceSpec) -> Result<(bool, Option<Resolution>)> {
        let strategy = &spec.strategy;
        if strategy.is_qualified() {
            let registry = self.require_registry()?;
            let resolved = registry.resolve(&strategy.selector_string())?;
            return Ok((true, Some(resolved.resolution)));
        }
        if let Some(registry) = &self.registry {
            if registry.contains_name(&strategy.identifier) {
                let resolved = registry.resolve(&strategy.identifier)?;
                return Ok((true, Some(resolved.resolution)));
            }
        }
        let known = {
            let factories = self
                .static_factories
                .read()
                .unwrap_or_else(|e| e.into_inner());
            factories.contains_key(&strategy.identifier)
        };
        if known {
            Ok((false, None))
        } else {
            Err(EngineError::ModuleNotFound {
                selector: strategy.identifier.clone(),
            })
        }
    }
}

/// Merge an outcome into the report, grouping by (strategy, hash, reason).
fn push_outcome(outcomes: &mut Vec<RefreshOutcome>, outcome: RefreshOutcome) {
    if let Some(existing) = outcomes.iter_mut().find(|o| {
        o.strategy == outcome.strategy && o.hash == outcome.hash && o.reason == outcome.reason
    }) {
        for instance in outcome.instances {
            if !existing.instances.contains(&instance) {
                existing.instances.push(instance);
            }
        }
        existing.instances.sort();
    } else {
        outcomes.push(outcome);
    }
}
