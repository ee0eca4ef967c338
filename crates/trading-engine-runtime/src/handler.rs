//! # Strategy Handler Contract
//!
//! A strategy instance is driven through the [`StrategyHandler`] trait: one
//! typed method per event it may observe, all defaulting to no-ops so a
//! handler declares only what it cares about. Handlers receive events by
//! reference; the supervisor keeps ownership and recycles every event
//! exactly once regardless of handler outcome.
//!
//! Handlers reach back into the engine through the [`StrategyRuntime`]
//! handle in their [`StrategyEnv`]: market state reads, provider selection,
//! and the order-submission path with its risk checks and dry-run
//! semantics.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use trading_engine_core::error::Result;
use trading_engine_core::event::{Event, EventType, OrderSide};

/// Published market-state snapshot of one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarketStateSnapshot {
    pub last_price: Option<f64>,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
}

impl MarketStateSnapshot {
    /// Midpoint of bid and ask, when both sides are present.
    pub fn mid_price(&self) -> Option<f64> {
        match (self.bid_price, self.ask_price) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }
}

/// Engine surface exposed to strategy handlers.
#[async_trait]
pub trait StrategyRuntime: Send + Sync {
    fn instance_id(&self) -> &str;
    fn providers(&self) -> Vec<String>;
    fn is_trading_active(&self) -> bool;
    fn is_dry_run(&self) -> bool;
    fn market_state(&self) -> MarketStateSnapshot;
    fn last_price(&self) -> Option<f64>;
    fn bid_price(&self) -> Option<f64>;
    fn ask_price(&self) -> Option<f64>;

    /// Deterministic provider pick: `providers[seed % len]`.
    fn select_provider(&self, seed: u64) -> Result<String>;

    /// Submit a LIMIT/GTC order on the instance's default symbol for the
    /// provider. Dry-run instances log and succeed without routing.
    async fn submit_order(
        &self,
        provider: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<()>;

    /// Submit a MARKET/IOC order; no price.
    async fn submit_market_order(
        &self,
        provider: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<()>;
}

/// Construction context handed to a strategy factory.
#[derive(Clone)]
pub struct StrategyEnv {
    /// Owning instance id
    pub instance_id: String,
    /// Instance config with module schema defaults applied
    pub config: serde_json::Map<String, Value>,
    /// Engine surface for the handler
    pub runtime: Arc<dyn StrategyRuntime>,
}

impl StrategyEnv {
    /// String config value by name.
    pub fn config_str(&self, name: &str) -> Option<&str> {
        self.config.get(name).and_then(Value::as_str)
    }

    /// Numeric config value by name.
    pub fn config_f64(&self, name: &str) -> Option<f64> {
        self.config.get(name).and_then(Value::as_f64)
    }
}

/// Typed event callbacks of one strategy instance. All methods default to
/// no-ops; errors are contained to the offending event and logged by the
/// supervisor.
#[async_trait]
pub trait StrategyHandler: Send + Sync {
    async fn on_trade(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_ticker(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_book_snapshot(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_kline_summary(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_instrument_update(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_balance_update(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_risk_control(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_extension_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_order_acknowledged(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_order_partial_fill(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_order_filled(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_order_cancelled(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_order_rejected(&self, _event: &Event, _reason: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn on_order_expired(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Whether the handler accepts events from more than one provider.
    /// The manager rejects multi-provider specs against handlers that do
    /// not opt in.
    fn wants_cross_provider_events(&self) -> bool {
        false
    }

    /// Called once when the owning instance stops.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds handlers for one statically registered strategy.
pub trait StrategyFactory: Send + Sync {
    /// Identifier instances bind to, e.g. `logging`.
    fn identifier(&self) -> &str;

    /// Event types instances of this strategy subscribe to.
    fn subscribed_events(&self) -> Vec<EventType>;

    /// Build a handler for one instance.
    fn build(&self, env: StrategyEnv) -> Result<Arc<dyn StrategyHandler>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mid_price_requires_both_sides() {
        let mut snapshot = MarketStateSnapshot::default();
        assert_eq!(snapshot.mid_price(), None);
        snapshot.bid_price = Some(100.0);
        assert_eq!(snapshot.mid_price(), None);
        snapshot.ask_price = Some(101.0);
        assert_eq!(snapshot.mid_price(), Some(100.5));
    }

    struct Passive;

    #[async_trait]
    impl StrategyHandler for Passive {}

    #[tokio::test]
    async fn test_default_handler_methods_are_noops() {
        let handler = Passive;
        let event = Event::default();
        assert!(handler.on_trade(&event).await.is_ok());
        assert!(handler.on_order_rejected(&event, Some("oops")).await.is_ok());
        assert!(!handler.wants_cross_provider_events());
        assert!(handler.close().await.is_ok());
    }
}
