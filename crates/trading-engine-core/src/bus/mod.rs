//! # Event Bus
//!
//! Accepts provider-emitted events, fans them out to every interested
//! subscription, and reclaims event memory through the recycler exactly
//! once per delivered copy.
//!
//! ## Fan-out contract
//!
//! For a single publish with N interested subscriptions:
//! - N == 0: the event is recycled immediately.
//! - N == 1: the original is delivered directly; the subscriber owns the
//!   single recycle.
//! - N > 1: N − 1 duplicates are allocated from the event pool and
//!   populated by structural copy on a bounded worker pool. The original
//!   goes to the first subscription, each duplicate to one of the rest;
//!   every delivery is independently owned and recycled. A partial
//!   duplicate-allocation failure recycles everything already allocated
//!   (original included) and reports the first error.
//!
//! ## Backpressure
//!
//! Market-data subscriptions never block the publisher: a full queue
//! coalesces latest-wins per `(provider, symbol)` for keyed types and
//! drops oldest for unkeyed ones. Critical subscriptions block the
//! publisher up to a bounded wait, then divert to the dead-letter sink —
//! critical events are never silently dropped or coalesced.

pub mod dead_letter;
mod queue;

pub use dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterSink};
pub use queue::EventReceiver;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::stream::{self, StreamExt};
use tracing::debug;
use uuid::Uuid;

use crate::config::BusConfig;
use crate::error::{EngineError, Result};
use crate::event::{Event, EventType, Recycler, SubscriptionClass};
use queue::{CriticalPush, SubscriptionQueue};

struct SubscriptionMap {
    by_type: HashMap<EventType, Vec<Arc<SubscriptionQueue>>>,
    index: HashMap<Uuid, EventType>,
}

struct BusShared {
    config: BusConfig,
    recycler: Arc<Recycler>,
    subscriptions: RwLock<SubscriptionMap>,
    routing_version: AtomicU64,
    closed: AtomicBool,
    dead_letters: Arc<DeadLetterSink>,
}

/// Bounded fan-out event bus with a centralized lifecycle recycler.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl EventBus {
    pub fn new(config: BusConfig, recycler: Arc<Recycler>) -> Self {
        let dead_letter_ring = config.dead_letter_ring;
        Self {
            shared: Arc::new(BusShared {
                config,
                recycler,
                subscriptions: RwLock::new(SubscriptionMap {
                    by_type: HashMap::new(),
                    index: HashMap::new(),
                }),
                routing_version: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                dead_letters: Arc::new(DeadLetterSink::new(dead_letter_ring)),
            }),
        }
    }

    /// The recycler backing this bus's event pool.
    pub fn recycler(&self) -> &Arc<Recycler> {
        &self.shared.recycler
    }

    /// Dead-letter sink receiving undeliverable critical events.
    pub fn dead_letters(&self) -> &Arc<DeadLetterSink> {
        &self.shared.dead_letters
    }

    /// Routing version stamped on the most recent publish.
    pub fn routing_version(&self) -> u64 {
        self.shared.routing_version.load(Ordering::Acquire)
    }

    /// Open a bounded subscription for one event type. The channel capacity
    /// is decided by the type's subscription class.
    pub fn subscribe(&self, event_type: EventType) -> Result<(Uuid, EventReceiver)> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(EngineError::BusClosed);
        }
        let capacity = match event_type.class() {
            SubscriptionClass::MarketData => self.shared.config.market_data_capacity,
            SubscriptionClass::Critical => self.shared.config.critical_capacity,
        };
        let queue = SubscriptionQueue::new(event_type, capacity);
        let id = queue.id();
        {
            let mut map = self
                .shared
                .subscriptions
                .write()
                .unwrap_or_else(|e| e.into_inner());
            map.by_type.entry(event_type).or_default().push(Arc::clone(&queue));
            map.index.insert(id, event_type);
        }
        debug!(%id, event_type = %event_type, "bus subscription opened");
        Ok((id, EventReceiver { queue }))
    }

    /// Close a subscription and release its buffered events through the
    /// recycler. Idempotent: unknown ids are a no-op.
    pub fn unsubscribe(&self, id: Uuid) {
        let queue = {
            let mut map = self
                .shared
                .subscriptions
                .write()
                .unwrap_or_else(|e| e.into_inner());
            let Some(event_type) = map.index.remove(&id) else {
                return;
            };
            let queues = map.by_type.entry(event_type).or_default();
            let pos = queues.iter().position(|q| q.id() == id);
            pos.map(|pos| queues.swap_remove(pos))
        };
        if let Some(queue) = queue {
            self.reap(&queue);
            debug!(%id, "bus subscription closed");
        }
    }

    /// Publish one event for fan-out. The bus takes ownership: on any
    /// failure the event (and any duplicates) are recycled before the
    /// error is returned, so callers never hold a dead borrow.
    pub async fn publish(&self, mut event: Box<Event>) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            shared.recycler.recycle_event(event);
            return Err(EngineError::BusClosed);
        }

        event.routing_version = shared.routing_version.fetch_add(1, Ordering::AcqRel) + 1;
        event.emit_ts = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        crate::metrics::record_publish();

        let queues: Vec<Arc<SubscriptionQueue>> = {
            let map = shared
                .subscriptions
                .read()
                .unwrap_or_else(|e| e.into_inner());
            map.by_type
                .get(&event.event_type)
                .map(|queues| queues.to_vec())
                .unwrap_or_default()
        };

        match queues.len() {
            0 => {
                shared.recycler.recycle_event(event);
                Ok(())
            }
            1 => {
                self.deliver(&queues[0], event).await;
                Ok(())
            }
            n => {
                let duplicates = self.clone_for_fanout(&event, n - 1).await;
                let duplicates = match duplicates {
                    Ok(duplicates) => duplicates,
                    Err(err) => {
                        shared.recycler.recycle_event(event);
                        return Err(err);
                    }
                };
                crate::metrics::record_fanout_duplicates((n - 1) as u64);

                let mut deliveries = Vec::with_capacity(n);
                let mut queues = queues.into_iter();
                let first = queues.next().expect("n > 1");
                deliveries.push(self.deliver_owned(first, event));
                for (queue, duplicate) in queues.zip(duplicates) {
                    deliveries.push(self.deliver_owned(queue, duplicate));
                }
                futures::future::join_all(deliveries).await;
                Ok(())
            }
        }
    }

    /// Mark the bus closed, reject further publishes, and release every
    /// subscription's buffered events through the recycler.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let queues: Vec<Arc<SubscriptionQueue>> = {
            let mut map = self
                .shared
                .subscriptions
                .write()
                .unwrap_or_else(|e| e.into_inner());
            map.index.clear();
            map.by_type.drain().flat_map(|(_, queues)| queues).collect()
        };
        for queue in queues {
            self.reap(&queue);
        }
        debug!("event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Allocate and populate `count` duplicates on a bounded worker pool.
    async fn clone_for_fanout(&self, original: &Event, count: usize) -> Result<Vec<Box<Event>>> {
        let recycler = &self.shared.recycler;
        let workers = self.shared.config.fanout_workers.max(1).min(count);
        let results: Vec<Result<Box<Event>>> = stream::iter(0..count)
            .map(|_| async move {
                let mut duplicate = recycler.acquire_event()?;
                duplicate.copy_from(original);
                Ok(duplicate)
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut duplicates = Vec::with_capacity(count);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(duplicate) => duplicates.push(duplicate),
                Err(err) => first_error = first_error.or(Some(err)),
            }
        }
        if let Some(err) = first_error {
            self.shared.recycler.recycle_events(duplicates);
            return Err(err);
        }
        Ok(duplicates)
    }

    async fn deliver_owned(&self, queue: Arc<SubscriptionQueue>, event: Box<Event>) {
        self.deliver(&queue, event).await;
    }

    async fn deliver(&self, queue: &Arc<SubscriptionQueue>, event: Box<Event>) {
        let shared = &self.shared;
        match queue.class() {
            SubscriptionClass::MarketData => queue.push_market(event, &shared.recycler),
            SubscriptionClass::Critical => {
                let timeout = shared.config.critical_send_timeout;
                match queue.push_critical(event, timeout).await {
                    CriticalPush::Delivered => {}
                    CriticalPush::TimedOut(event) => {
                        shared
                            .dead_letters
                            .record(&event, queue.id(), DeadLetterReason::SendTimeout);
                        shared.recycler.recycle_event(event);
                    }
                    CriticalPush::Closed(event) => {
                        shared
                            .dead_letters
                            .record(&event, queue.id(), DeadLetterReason::SubscriptionClosed);
                        shared.recycler.recycle_event(event);
                    }
                }
            }
        }
    }

    /// Close one queue and release its buffer, dead-lettering critical
    /// events that were never received.
    fn reap(&self, queue: &Arc<SubscriptionQueue>) {
        let buffered = queue.close();
        for event in buffered {
            if queue.class() == SubscriptionClass::Critical {
                self.shared
                    .dead_letters
                    .record(&event, queue.id(), DeadLetterReason::SubscriptionClosed);
            }
            self.shared.recycler.recycle_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, OrderSide};
    use std::time::Duration;

    fn bus() -> EventBus {
        EventBus::new(BusConfig::default(), Arc::new(Recycler::with_defaults()))
    }

    fn trade(bus: &EventBus, symbol: &str, price: &str) -> Box<Event> {
        let mut event = bus.recycler().acquire_event().unwrap();
        event.provider = "okx-spot".to_string();
        event.symbol = symbol.to_string();
        event.event_type = EventType::Trade;
        event.payload = EventPayload::Trade {
            trade_id: "t1".to_string(),
            price: price.to_string(),
            quantity: "1".to_string(),
            side: Some(OrderSide::Buy),
        };
        event
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_recycles() {
        let bus = bus();
        let event = trade(&bus, "BTC-USDT", "100.5");
        bus.publish(event).await.unwrap();
        assert_eq!(bus.recycler().live_events(), 0);
    }

    #[tokio::test]
    async fn test_publish_after_close_fails_and_recycles() {
        let bus = bus();
        bus.close();
        let event = trade(&bus, "BTC-USDT", "100.5");
        match bus.publish(event).await {
            Err(EngineError::BusClosed) => {}
            other => panic!("expected BusClosed, got {other:?}"),
        }
        assert_eq!(bus.recycler().live_events(), 0);
    }

    #[tokio::test]
    async fn test_single_subscriber_receives_original() {
        let bus = bus();
        let (_id, mut rx) = bus.subscribe(EventType::Trade).unwrap();
        bus.publish(trade(&bus, "BTC-USDT", "100.5")).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.symbol, "BTC-USDT");
        assert_eq!(event.routing_version, 1);
        bus.recycler().recycle_event(event);
        assert_eq!(bus.recycler().live_events(), 0);
    }

    #[tokio::test]
    async fn test_two_subscribers_observe_identical_payloads() {
        let bus = bus();
        let (_a, mut rx_a) = bus.subscribe(EventType::Trade).unwrap();
        let (_b, mut rx_b) = bus.subscribe(EventType::Trade).unwrap();
        bus.publish(trade(&bus, "BTC-USDT", "100.5")).await.unwrap();

        let ea = rx_a.recv().await.unwrap();
        let eb = rx_b.recv().await.unwrap();
        assert_eq!(ea.payload, eb.payload);
        assert_eq!(ea.routing_version, eb.routing_version);
        bus.recycler().recycle_event(ea);
        bus.recycler().recycle_event(eb);
        assert_eq!(bus.recycler().live_events(), 0);
    }

    #[tokio::test]
    async fn test_routing_version_is_monotonic() {
        let bus = bus();
        let (_id, mut rx) = bus.subscribe(EventType::Ticker).unwrap();
        for _ in 0..3 {
            let mut event = bus.recycler().acquire_event().unwrap();
            event.provider = "okx-spot".to_string();
            event.symbol = "BTC-USDT".to_string();
            event.event_type = EventType::Ticker;
            bus.publish(event).await.unwrap();
        }
        let mut last = 0;
        while let Some(event) = rx.try_recv() {
            assert!(event.routing_version > last);
            last = event.routing_version;
            bus.recycler().recycle_event(event);
        }
        assert_eq!(last, 3);
    }

    #[tokio::test]
    async fn test_critical_overload_diverts_to_dead_letter() {
        let config = BusConfig {
            critical_capacity: 1,
            critical_send_timeout: Duration::from_millis(10),
            ..BusConfig::default()
        };
        let bus = EventBus::new(config, Arc::new(Recycler::with_defaults()));
        let (_id, mut rx) = bus.subscribe(EventType::ExecReport).unwrap();

        for _ in 0..3 {
            let mut event = bus.recycler().acquire_event().unwrap();
            event.provider = "okx-spot".to_string();
            event.symbol = "BTC-USDT".to_string();
            event.event_type = EventType::ExecReport;
            bus.publish(event).await.unwrap();
        }

        // One delivered, two diverted after the bounded wait.
        assert_eq!(bus.dead_letters().total(), 2);
        let delivered = rx.recv().await.unwrap();
        bus.recycler().recycle_event(delivered);
        assert_eq!(bus.recycler().live_events(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_buffered_events() {
        let bus = bus();
        let (id, rx) = bus.subscribe(EventType::Trade).unwrap();
        bus.publish(trade(&bus, "BTC-USDT", "1")).await.unwrap();
        bus.publish(trade(&bus, "BTC-USDT", "2")).await.unwrap();
        assert_eq!(rx.len(), 2);
        bus.unsubscribe(id);
        assert_eq!(bus.recycler().live_events(), 0);
    }

    #[tokio::test]
    async fn test_market_and_critical_subscribers_fan_out_independently() {
        let bus = bus();
        let (_t, mut trade_rx) = bus.subscribe(EventType::Trade).unwrap();
        let (_e, mut exec_rx) = bus.subscribe(EventType::ExecReport).unwrap();

        bus.publish(trade(&bus, "BTC-USDT", "100.5")).await.unwrap();
        let mut exec = bus.recycler().acquire_event().unwrap();
        exec.provider = "okx-spot".to_string();
        exec.symbol = "BTC-USDT".to_string();
        exec.event_type = EventType::ExecReport;
        bus.publish(exec).await.unwrap();

        let t = trade_rx.recv().await.unwrap();
        assert_eq!(t.event_type, EventType::Trade);
        let e = exec_rx.recv().await.unwrap();
        assert_eq!(e.event_type, EventType::ExecReport);
        bus.recycler().recycle_events(vec![t, e]);
        assert_eq!(bus.recycler().live_events(), 0);
    }
}
