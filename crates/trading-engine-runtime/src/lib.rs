//! # Trading Engine Runtime
//!
//! The strategy runtime on top of the distribution core:
//! - Instance specs with normalization and update immutability
//! - The strategy handler/factory contract and the runtime surface
//!   handlers program against
//! - Per-instance supervisors owning subscriptions, market state, and the
//!   order path with risk checks and dry-run semantics
//! - The manager orchestrating create/start/stop/update/remove, revision
//!   usage guards, and targeted registry refresh
//! - Built-in `logging` and `delay` reference strategies
//!
//! ## Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trading_engine_core::{
//!     bus::EventBus, config::BusConfig, dispatch::{DispatchTable, RouteRegistrar},
//!     event::Recycler, provider::ProviderCatalog,
//! };
//! use trading_engine_runtime::{
//!     manager::StrategyManager, risk::OpenRiskManager, spec::InstanceSpec,
//! };
//!
//! # async fn demo(router: Arc<dyn trading_engine_core::provider::OrderRouter>) -> trading_engine_core::error::Result<()> {
//! let recycler = Arc::new(Recycler::with_defaults());
//! let bus = EventBus::new(BusConfig::default(), recycler);
//! let catalog = Arc::new(ProviderCatalog::new());
//! let registrar = Arc::new(RouteRegistrar::new(Arc::new(DispatchTable::new()), Arc::clone(&catalog)));
//! let manager = StrategyManager::new(bus, registrar, catalog, Arc::new(OpenRiskManager), router);
//!
//! let spec: InstanceSpec = serde_json::from_str(r#"{
//!     "id": "alpha",
//!     "strategy": {"identifier": "logging", "config": {"logger_prefix": "[demo]"}},
//!     "providers": ["okx-spot"],
//!     "providerSymbols": {"okx-spot": {"symbols": ["BTC-USDT"]}}
//! }"#)?;
//! manager.create(spec).await?;
//! manager.start("alpha").await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod handler;
pub mod manager;
pub mod risk;
pub mod spec;
pub mod strategies;
pub mod supervisor;
pub mod usage;

pub use handler::{
    MarketStateSnapshot, StrategyEnv, StrategyFactory, StrategyHandler, StrategyRuntime,
};
pub use manager::{
    EchoModuleHandlerFactory, InstanceSnapshot, ModuleHandlerFactory, RefreshOutcome,
    RefreshReason, RefreshTargets, StrategyManager,
};
pub use risk::{OpenRiskManager, RiskBreach, RiskManager};
pub use spec::{InstanceSpec, ProviderSymbols, StrategySpec};
pub use supervisor::{Supervisor, SupervisorCore};
pub use usage::{revision_key, RevisionUsage, UsageTracker};

/// Current version of the runtime crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
