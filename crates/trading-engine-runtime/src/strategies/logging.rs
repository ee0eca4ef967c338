//! Logging strategy: writes one structured log line per observed event.
//!
//! Config:
//! - `logger_prefix` (string, default `[logging]`) — prefix on every line

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use trading_engine_core::error::Result;
use trading_engine_core::event::{Event, EventType};

use crate::handler::{StrategyEnv, StrategyFactory, StrategyHandler};

pub struct LoggingStrategy {
    prefix: String,
    observed: AtomicU64,
}

impl LoggingStrategy {
    /// Events observed since start; used by embedders to sanity-check
    /// wiring.
    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    fn log(&self, kind: &str, event: &Event) {
        self.observed.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "strategy::logging",
            prefix = %self.prefix,
            kind,
            provider = %event.provider,
            symbol = %event.symbol,
            routing_version = event.routing_version,
            "event observed"
        );
    }
}

#[async_trait]
impl StrategyHandler for LoggingStrategy {
    async fn on_trade(&self, event: &Event) -> Result<()> {
        self.log("trade", event);
        Ok(())
    }

    async fn on_ticker(&self, event: &Event) -> Result<()> {
        self.log("ticker", event);
        Ok(())
    }

    async fn on_book_snapshot(&self, event: &Event) -> Result<()> {
        self.log("book-snapshot", event);
        Ok(())
    }

    async fn on_balance_update(&self, event: &Event) -> Result<()> {
        self.log("balance-update", event);
        Ok(())
    }

    async fn on_risk_control(&self, event: &Event) -> Result<()> {
        self.log("risk-control", event);
        Ok(())
    }

    async fn on_order_filled(&self, event: &Event) -> Result<()> {
        self.log("order-filled", event);
        Ok(())
    }

    async fn on_order_rejected(&self, event: &Event, reason: Option<&str>) -> Result<()> {
        info!(
            target: "strategy::logging",
            prefix = %self.prefix,
            reason = reason.unwrap_or("unspecified"),
            "order rejected"
        );
        self.log("order-rejected", event);
        Ok(())
    }
}

/// Factory for the `logging` identifier.
pub struct LoggingStrategyFactory;

impl StrategyFactory for LoggingStrategyFactory {
    fn identifier(&self) -> &str {
        "logging"
    }

    fn subscribed_events(&self) -> Vec<EventType> {
        vec![
            EventType::Trade,
            EventType::Ticker,
            EventType::BookSnapshot,
            EventType::ExecReport,
            EventType::BalanceUpdate,
            EventType::RiskControl,
        ]
    }

    fn build(&self, env: StrategyEnv) -> Result<Arc<dyn StrategyHandler>> {
        let prefix = env
            .config_str("logger_prefix")
            .unwrap_or("[logging]")
            .to_string();
        Ok(Arc::new(LoggingStrategy {
            prefix,
            observed: AtomicU64::new(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MarketStateSnapshot;
    use crate::handler::StrategyRuntime;
    use rust_decimal::Decimal;
    use trading_engine_core::event::OrderSide;

    struct StubRuntime;

    #[async_trait]
    impl StrategyRuntime for StubRuntime {
        fn instance_id(&self) -> &str {
            "stub"
        }
        fn providers(&self) -> Vec<String> {
            vec![]
        }
        fn is_trading_active(&self) -> bool {
            false
        }
        fn is_dry_run(&self) -> bool {
            true
        }
        fn market_state(&self) -> MarketStateSnapshot {
            MarketStateSnapshot::default()
        }
        fn last_price(&self) -> Option<f64> {
            None
        }
        fn bid_price(&self) -> Option<f64> {
            None
        }
        fn ask_price(&self) -> Option<f64> {
            None
        }
        fn select_provider(&self, _seed: u64) -> Result<String> {
            Ok("stub".to_string())
        }
        async fn submit_order(
            &self,
            _provider: &str,
            _side: OrderSide,
            _quantity: Decimal,
            _price: Decimal,
        ) -> Result<()> {
            Ok(())
        }
        async fn submit_market_order(
            &self,
            _provider: &str,
            _side: OrderSide,
            _quantity: Decimal,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_prefix_from_config_and_observation_count() {
        let mut config = serde_json::Map::new();
        config.insert("logger_prefix".to_string(), serde_json::json!("[test]"));
        let env = StrategyEnv {
            instance_id: "alpha".to_string(),
            config,
            runtime: Arc::new(StubRuntime),
        };
        let handler = LoggingStrategyFactory.build(env).unwrap();

        let event = Event::default();
        handler.on_trade(&event).await.unwrap();
        handler.on_ticker(&event).await.unwrap();
        // Default no-op methods still succeed.
        handler.on_kline_summary(&event).await.unwrap();
    }
}
