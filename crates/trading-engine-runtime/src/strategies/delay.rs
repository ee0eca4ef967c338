//! Delay strategy: sleeps a configured interval in each handler before
//! logging. Exists to exercise slow-consumer behavior (coalescing,
//! critical-event guarantees) under controlled load.
//!
//! Config:
//! - `interval_ms` (number, default 100) — per-event handler delay

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use trading_engine_core::error::Result;
use trading_engine_core::event::{Event, EventType};

use crate::handler::{StrategyEnv, StrategyFactory, StrategyHandler};

pub struct DelayStrategy {
    interval: Duration,
}

impl DelayStrategy {
    async fn linger(&self, kind: &str, event: &Event) {
        tokio::time::sleep(self.interval).await;
        debug!(
            target: "strategy::delay",
            kind,
            provider = %event.provider,
            symbol = %event.symbol,
            delayed_ms = self.interval.as_millis() as u64,
            "event handled after delay"
        );
    }
}

#[async_trait]
impl StrategyHandler for DelayStrategy {
    async fn on_trade(&self, event: &Event) -> Result<()> {
        self.linger("trade", event).await;
        Ok(())
    }

    async fn on_ticker(&self, event: &Event) -> Result<()> {
        self.linger("ticker", event).await;
        Ok(())
    }

    async fn on_order_filled(&self, event: &Event) -> Result<()> {
        self.linger("order-filled", event).await;
        Ok(())
    }
}

/// Factory for the `delay` identifier.
pub struct DelayStrategyFactory;

impl StrategyFactory for DelayStrategyFactory {
    fn identifier(&self) -> &str {
        "delay"
    }

    fn subscribed_events(&self) -> Vec<EventType> {
        vec![EventType::Trade, EventType::Ticker, EventType::ExecReport]
    }

    fn build(&self, env: StrategyEnv) -> Result<Arc<dyn StrategyHandler>> {
        let interval = env
            .config_f64("interval_ms")
            .filter(|ms| *ms >= 0.0)
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(Duration::from_millis(100));
        Ok(Arc::new(DelayStrategy { interval }))
    }
}
