//! # Event Data Model
//!
//! Typed event records flowing from exchange providers to strategy
//! instances, and the pooled order-request record used on the submission
//! path.
//!
//! Events are pool-allocated: every [`Event`] delivered by the bus carries a
//! one-shot ownership ticket, and the owner must return it through the
//! [`Recycler`](crate::event::recycler::Recycler) exactly once. The payload
//! is a typed variant matching the event type; prices travel as strings and
//! are parsed at the consuming edge.

pub mod pool;
pub mod recycler;

pub use pool::PoolConfig;
pub use recycler::Recycler;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Enumerated event types carried on the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Trade,
    Ticker,
    BookSnapshot,
    ExecReport,
    KlineSummary,
    InstrumentUpdate,
    BalanceUpdate,
    RiskControl,
    #[default]
    Extension,
}

impl EventType {
    /// All enumerated variants, in declaration order.
    pub const ALL: [EventType; 9] = [
        EventType::Trade,
        EventType::Ticker,
        EventType::BookSnapshot,
        EventType::ExecReport,
        EventType::KlineSummary,
        EventType::InstrumentUpdate,
        EventType::BalanceUpdate,
        EventType::RiskControl,
        EventType::Extension,
    ];

    /// Delivery-policy class for subscriptions of this type.
    ///
    /// Critical events are never dropped or coalesced; market-data events
    /// coalesce or drop under backpressure.
    pub fn class(&self) -> SubscriptionClass {
        match self {
            EventType::ExecReport | EventType::RiskControl | EventType::BalanceUpdate => {
                SubscriptionClass::Critical
            }
            _ => SubscriptionClass::MarketData,
        }
    }

    /// Whether events of this type coalesce per `(provider, symbol)` under
    /// backpressure. Trades and extension events have no natural
    /// latest-wins key and drop-oldest instead.
    pub fn coalesces(&self) -> bool {
        matches!(
            self,
            EventType::Ticker
                | EventType::BookSnapshot
                | EventType::KlineSummary
                | EventType::InstrumentUpdate
        )
    }

    /// Wire name of the variant, e.g. `book-snapshot`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Trade => "trade",
            EventType::Ticker => "ticker",
            EventType::BookSnapshot => "book-snapshot",
            EventType::ExecReport => "exec-report",
            EventType::KlineSummary => "kline-summary",
            EventType::InstrumentUpdate => "instrument-update",
            EventType::BalanceUpdate => "balance-update",
            EventType::RiskControl => "risk-control",
            EventType::Extension => "extension",
        }
    }

    /// Parse a wire name back into a variant.
    pub fn parse(s: &str) -> Option<EventType> {
        EventType::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery-policy tag attached to each bus subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionClass {
    /// Bounded channel; latest-wins coalescing or drop-oldest on full
    MarketData,
    /// Larger bound; blocking send with dead-letter diversion on expiry
    Critical,
}

/// One price level of an order book side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: String,
    pub quantity: String,
}

/// Execution-report lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecState {
    Ack,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

/// Typed payload variants, one per [`EventType`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EventPayload {
    /// Zeroed payload of a recycled event
    #[default]
    Empty,
    Trade {
        trade_id: String,
        price: String,
        quantity: String,
        side: Option<OrderSide>,
    },
    Ticker {
        last_price: String,
        bid_price: String,
        ask_price: String,
    },
    BookSnapshot {
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
    },
    ExecReport {
        client_order_id: String,
        exchange_order_id: String,
        state: ExecState,
        filled_quantity: String,
        avg_price: String,
        reject_reason: Option<String>,
    },
    KlineSummary {
        interval: String,
        open: String,
        high: String,
        low: String,
        close: String,
        volume: String,
    },
    InstrumentUpdate {
        status: String,
        details: serde_json::Value,
    },
    BalanceUpdate {
        total: String,
        available: String,
    },
    RiskControl {
        breach_type: String,
        reason: String,
        metrics: HashMap<String, f64>,
        kill_switch: bool,
        circuit_breaker: bool,
        consumer_id: String,
    },
    Extension {
        ext_kind: String,
        data: serde_json::Value,
    },
}

/// A single event record flowing through the distribution core.
///
/// Instances are pool-allocated; ownership transfers with the `Box` and the
/// final owner recycles it through the recycler gateway. All fields reset to
/// zero values on recycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Provider-scoped event id
    pub event_id: u64,
    /// Originating provider, e.g. `okx-spot`
    pub provider: String,
    /// Instrument symbol; for balance updates this carries a currency code
    pub symbol: String,
    /// Enumerated event type; governs payload variant and delivery class
    pub event_type: EventType,
    /// Nanoseconds since epoch when the provider adapter ingested the event
    pub ingest_ts: i64,
    /// Nanoseconds since epoch when the bus accepted the publish
    pub emit_ts: i64,
    /// Monotonic version stamped by the bus at publish time
    pub routing_version: u64,
    /// Typed payload matching `event_type`
    pub payload: EventPayload,
}

impl Event {
    /// Structural copy from another event, reusing this record's allocation
    /// where possible. Used by the fan-out path to populate duplicates.
    pub fn copy_from(&mut self, other: &Event) {
        self.event_id = other.event_id;
        self.provider.clear();
        self.provider.push_str(&other.provider);
        self.symbol.clear();
        self.symbol.push_str(&other.symbol);
        self.event_type = other.event_type;
        self.ingest_ts = other.ingest_ts;
        self.emit_ts = other.emit_ts;
        self.routing_version = other.routing_version;
        self.payload = other.payload.clone();
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    #[default]
    Buy,
    Sell,
}

/// Order type on the submission path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    #[default]
    Limit,
    Market,
}

/// Time-in-force on the submission path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    #[default]
    Gtc,
    Ioc,
}

/// Pooled order-submission record.
///
/// Acquired from the recycler by the supervisor's order path, populated,
/// handed to the risk manager and order router by reference, and always
/// released back through the recycler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// `<instance-id>-<nanos>-<count>`; the instance-id prefix is the
    /// ownership test for exec reports
    pub client_order_id: String,
    /// Owning instance id
    pub consumer_id: String,
    pub provider: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<rust_decimal::Decimal>,
    pub quantity: rust_decimal::Decimal,
    pub time_in_force: TimeInForce,
    /// Nanoseconds since epoch at submission
    pub timestamp: i64,
}

/// Contract for pool-managed records: zeroing on return, and a poison
/// sentinel used by the recycler's debug mode to surface use-after-recycle.
pub trait Recyclable: Default + Send + 'static {
    /// Pooled resource name used in errors and metrics.
    const RESOURCE: &'static str;

    /// Reset every field to its zero value, clearing held references.
    fn reset(&mut self);

    /// Overwrite fields with an obviously-wrong sentinel.
    fn poison(&mut self);
}

impl Recyclable for Event {
    const RESOURCE: &'static str = "event";

    fn reset(&mut self) {
        self.event_id = 0;
        self.provider.clear();
        self.symbol.clear();
        self.event_type = EventType::default();
        self.ingest_ts = 0;
        self.emit_ts = 0;
        self.routing_version = 0;
        self.payload = EventPayload::Empty;
    }

    fn poison(&mut self) {
        self.event_id = u64::MAX;
        self.provider = "!recycled".to_string();
        self.symbol = "!recycled".to_string();
        self.ingest_ts = i64::MIN;
        self.emit_ts = i64::MIN;
    }
}

impl Recyclable for OrderRequest {
    const RESOURCE: &'static str = "order_request";

    fn reset(&mut self) {
        self.client_order_id.clear();
        self.consumer_id.clear();
        self.provider.clear();
        self.symbol.clear();
        self.side = OrderSide::default();
        self.order_type = OrderType::default();
        self.price = None;
        self.quantity = rust_decimal::Decimal::ZERO;
        self.time_in_force = TimeInForce::default();
        self.timestamp = 0;
    }

    fn poison(&mut self) {
        self.client_order_id = "!recycled".to_string();
        self.consumer_id = "!recycled".to_string();
        self.timestamp = i64::MIN;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_classes() {
        assert_eq!(EventType::Trade.class(), SubscriptionClass::MarketData);
        assert_eq!(EventType::Ticker.class(), SubscriptionClass::MarketData);
        assert_eq!(EventType::ExecReport.class(), SubscriptionClass::Critical);
        assert_eq!(EventType::RiskControl.class(), SubscriptionClass::Critical);
        assert_eq!(EventType::BalanceUpdate.class(), SubscriptionClass::Critical);
        assert_eq!(EventType::Extension.class(), SubscriptionClass::MarketData);
    }

    #[test]
    fn test_trades_do_not_coalesce() {
        assert!(!EventType::Trade.coalesces());
        assert!(!EventType::Extension.coalesces());
        assert!(EventType::Ticker.coalesces());
        assert!(EventType::BookSnapshot.coalesces());
    }

    #[test]
    fn test_event_type_round_trips_wire_names() {
        for t in EventType::ALL {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EventType::parse("no-such-type"), None);
    }

    #[test]
    fn test_copy_from_is_structural() {
        let mut src = Event::default();
        src.event_id = 7;
        src.provider = "okx-spot".to_string();
        src.symbol = "BTC-USDT".to_string();
        src.event_type = EventType::Trade;
        src.routing_version = 42;
        src.payload = EventPayload::Trade {
            trade_id: "t1".to_string(),
            price: "100.5".to_string(),
            quantity: "0.25".to_string(),
            side: Some(OrderSide::Buy),
        };

        let mut dup = Event::default();
        dup.copy_from(&src);
        assert_eq!(dup, src);
    }

    #[test]
    fn test_reset_returns_to_zero_values() {
        let mut event = Event {
            event_id: 9,
            provider: "binance-spot".to_string(),
            symbol: "ETH-USDT".to_string(),
            event_type: EventType::Ticker,
            ingest_ts: 1,
            emit_ts: 2,
            routing_version: 3,
            payload: EventPayload::Ticker {
                last_price: "1".to_string(),
                bid_price: "1".to_string(),
                ask_price: "1".to_string(),
            },
        };
        event.reset();
        assert_eq!(event, Event::default());
    }
}
