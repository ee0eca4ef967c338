//! # Trading Engine Core
//!
//! This crate provides the event distribution core of the trading pipeline:
//! - Typed event and order records with pooled lifecycles
//! - The recycler gateway enforcing the recycle-once contract
//! - A bounded fan-out event bus with per-class backpressure and a
//!   dead-letter sink for undeliverable critical events
//! - The dynamic dispatch table, filter evaluation, and route registrar
//! - Provider adapter and order-router seams
//!
//! ## Features
//!
//! - `monitoring` - Enables Prometheus metrics collection (default)
//!
//! ## Core Concepts
//!
//! The distribution core is built around these key abstractions:
//!
//! - **Event**: pool-allocated record with a one-shot ownership ticket
//! - **Recycler**: the single gateway returning records to their pools
//! - **EventBus**: fan-out fabric; one bounded queue per subscription
//! - **DispatchTable**: versioned `(provider, type) → Route` map with
//!   lock-free snapshot reads
//! - **RouteRegistrar**: reference-counted bridge from route interest to
//!   provider subscriptions
//!
//! ## Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use trading_engine_core::{
//!     bus::EventBus,
//!     config::BusConfig,
//!     event::{EventType, Recycler},
//! };
//!
//! # async fn demo() -> trading_engine_core::error::Result<()> {
//! let recycler = Arc::new(Recycler::with_defaults());
//! let bus = EventBus::new(BusConfig::default(), Arc::clone(&recycler));
//!
//! let (_id, mut trades) = bus.subscribe(EventType::Trade)?;
//!
//! let mut event = recycler.acquire_event()?;
//! event.provider = "okx-spot".to_string();
//! event.symbol = "BTC-USDT".to_string();
//! event.event_type = EventType::Trade;
//! bus.publish(event).await?;
//!
//! if let Some(event) = trades.recv().await {
//!     // ... dispatch to a strategy handler ...
//!     recycler.recycle_event(event);
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod metrics;
pub mod provider;

// Re-export commonly used types
pub use bus::{DeadLetterEntry, DeadLetterReason, DeadLetterSink, EventBus, EventReceiver};
pub use config::{BusConfig, EngineConfig};
pub use dispatch::{
    DispatchTable, EventView, FilterOp, FilterRule, InstanceRegistration, RestPollerSpec, Route,
    RouteDeclaration, RouteRegistrar,
};
pub use error::{EngineError, ErrorCategory, Result};
pub use event::{
    Event, EventPayload, EventType, ExecState, OrderRequest, OrderSide, OrderType, PoolConfig,
    Recycler, SubscriptionClass, TimeInForce,
};
pub use provider::{OrderRouter, ProviderAdapter, ProviderCatalog};

/// Current version of the trading engine core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        BusConfig, DispatchTable, EngineError, Event, EventBus, EventPayload, EventType,
        OrderRequest, OrderSide, ProviderCatalog, Recycler, Result, Route, RouteRegistrar,
        SubscriptionClass,
    };
    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
    pub use uuid::Uuid;
}
