//! Per-subscription delivery queues.
//!
//! Each subscription owns one bounded queue whose overflow policy is decided
//! by its [`SubscriptionClass`]: market-data queues coalesce or drop and
//! never block the publisher; critical queues make the publisher wait for
//! space up to a bounded timeout.
//!
//! Every event handed to a queue is owned by it until popped by the
//! receiver or recycled on overflow/close, so the recycle-once contract
//! holds across all queue paths.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::event::{Event, EventType, Recycler, SubscriptionClass};

/// Outcome of a critical-class push.
pub(crate) enum CriticalPush {
    /// Event enqueued
    Delivered,
    /// Wait for space expired; the event is handed back for dead-lettering
    TimedOut(Box<Event>),
    /// Queue closed before delivery; the event is handed back
    Closed(Box<Event>),
}

struct QueueState {
    deque: VecDeque<Box<Event>>,
    closed: bool,
}

/// Bounded delivery queue for a single subscription.
pub(crate) struct SubscriptionQueue {
    id: Uuid,
    event_type: EventType,
    class: SubscriptionClass,
    capacity: usize,
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
}

impl SubscriptionQueue {
    pub(crate) fn new(event_type: EventType, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            event_type,
            class: event_type.class(),
            capacity,
            state: Mutex::new(QueueState {
                deque: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn event_type(&self) -> EventType {
        self.event_type
    }

    pub(crate) fn class(&self) -> SubscriptionClass {
        self.class
    }

    /// Non-blocking market-data push. On a full queue, keyed types replace
    /// the oldest queued event of the same `(provider, symbol)`; unkeyed
    /// types drop the oldest queued event. Never fails, never blocks.
    pub(crate) fn push_market(&self, event: Box<Event>, recycler: &Recycler) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            drop(state);
            recycler.recycle_event(event);
            return;
        }
        if state.deque.len() < self.capacity {
            state.deque.push_back(event);
            drop(state);
            self.readable.notify_one();
            return;
        }

        if event.event_type.coalesces() {
            let slot = state
                .deque
                .iter_mut()
                .find(|queued| queued.provider == event.provider && queued.symbol == event.symbol);
            if let Some(slot) = slot {
                let old = std::mem::replace(slot, event);
                drop(state);
                recycler.recycle_event(old);
                crate::metrics::record_coalesced();
                self.readable.notify_one();
                return;
            }
        }

        // No coalescing key in the queue: make room oldest-first.
        let oldest = state.deque.pop_front();
        state.deque.push_back(event);
        drop(state);
        if let Some(oldest) = oldest {
            recycler.recycle_event(oldest);
            crate::metrics::record_dropped();
        }
        self.readable.notify_one();
    }

    /// Critical push: wait for space up to `timeout`, then hand the event
    /// back for dead-lettering. Critical events are never dropped here.
    pub(crate) async fn push_critical(
        &self,
        event: Box<Event>,
        timeout: Duration,
    ) -> CriticalPush {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let writable = self.writable.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.closed {
                    return CriticalPush::Closed(event);
                }
                if state.deque.len() < self.capacity {
                    state.deque.push_back(event);
                    drop(state);
                    self.readable.notify_one();
                    return CriticalPush::Delivered;
                }
            }
            match tokio::time::timeout_at(deadline, writable).await {
                Ok(()) => continue,
                Err(_) => return CriticalPush::TimedOut(event),
            }
        }
    }

    pub(crate) fn try_pop(&self) -> Option<Box<Event>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let event = state.deque.pop_front();
        drop(state);
        if event.is_some() {
            self.writable.notify_one();
        }
        event
    }

    pub(crate) async fn pop(&self) -> Option<Box<Event>> {
        loop {
            let readable = self.readable.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(event) = state.deque.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    /// Close the queue and return the buffered events for the caller to
    /// recycle (and dead-letter, for critical subscriptions).
    pub(crate) fn close(&self) -> Vec<Box<Event>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        let buffered = state.deque.drain(..).collect();
        drop(state);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        buffered
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).deque.len()
    }
}

/// Receiving half of a subscription, handed out by
/// [`EventBus::subscribe`](crate::bus::EventBus::subscribe).
///
/// Every event received transfers ownership to the caller, who must return
/// it through the recycler exactly once.
pub struct EventReceiver {
    pub(crate) queue: Arc<SubscriptionQueue>,
}

impl EventReceiver {
    /// Wait for the next event. Returns `None` once the subscription is
    /// closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Box<Event>> {
        self.queue.pop().await
    }

    /// Pop without waiting; used by shutdown drains.
    pub fn try_recv(&mut self) -> Option<Box<Event>> {
        self.queue.try_pop()
    }

    pub fn subscription_id(&self) -> Uuid {
        self.queue.id()
    }

    pub fn event_type(&self) -> EventType {
        self.queue.event_type()
    }

    pub fn class(&self) -> SubscriptionClass {
        self.queue.class()
    }

    /// Buffered events not yet received.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;

    fn event(recycler: &Recycler, event_type: EventType, symbol: &str) -> Box<Event> {
        let mut e = recycler.acquire_event().unwrap();
        e.provider = "okx-spot".to_string();
        e.symbol = symbol.to_string();
        e.event_type = event_type;
        e
    }

    #[tokio::test]
    async fn test_market_push_coalesces_same_key_when_full() {
        let recycler = Recycler::with_defaults();
        let queue = SubscriptionQueue::new(EventType::Ticker, 2);

        let mut a = event(&recycler, EventType::Ticker, "BTC-USDT");
        a.event_id = 1;
        queue.push_market(a, &recycler);
        let mut b = event(&recycler, EventType::Ticker, "ETH-USDT");
        b.event_id = 2;
        queue.push_market(b, &recycler);

        // Full queue: the BTC ticker is overwritten in place by the newer one.
        let mut c = event(&recycler, EventType::Ticker, "BTC-USDT");
        c.event_id = 3;
        queue.push_market(c, &recycler);

        assert_eq!(queue.len(), 2);
        let first = queue.try_pop().unwrap();
        assert_eq!(first.event_id, 3);
        assert_eq!(first.symbol, "BTC-USDT");
        recycler.recycle_event(first);
        let second = queue.try_pop().unwrap();
        assert_eq!(second.event_id, 2);
        recycler.recycle_event(second);
        assert_eq!(recycler.live_events(), 0);
    }

    #[tokio::test]
    async fn test_market_push_drops_oldest_for_unkeyed_types() {
        let recycler = Recycler::with_defaults();
        let queue = SubscriptionQueue::new(EventType::Trade, 2);

        for id in 1..=3u64 {
            let mut e = event(&recycler, EventType::Trade, "BTC-USDT");
            e.event_id = id;
            e.payload = EventPayload::Trade {
                trade_id: id.to_string(),
                price: "1".to_string(),
                quantity: "1".to_string(),
                side: None,
            };
            queue.push_market(e, &recycler);
        }

        let ids: Vec<u64> = std::iter::from_fn(|| queue.try_pop())
            .map(|e| {
                let id = e.event_id;
                recycler.recycle_event(e);
                id
            })
            .collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(recycler.live_events(), 0);
    }

    #[tokio::test]
    async fn test_critical_push_times_out_when_full() {
        let recycler = Recycler::with_defaults();
        let queue = SubscriptionQueue::new(EventType::ExecReport, 1);

        let first = event(&recycler, EventType::ExecReport, "BTC-USDT");
        assert!(matches!(
            queue.push_critical(first, Duration::from_millis(10)).await,
            CriticalPush::Delivered
        ));

        let second = event(&recycler, EventType::ExecReport, "BTC-USDT");
        match queue.push_critical(second, Duration::from_millis(10)).await {
            CriticalPush::TimedOut(e) => recycler.recycle_event(e),
            _ => panic!("expected timeout"),
        }

        let buffered = queue.close();
        recycler.recycle_events(buffered);
        assert_eq!(recycler.live_events(), 0);
    }

    #[tokio::test]
    async fn test_critical_push_resumes_after_pop() {
        let recycler = Recycler::with_defaults();
        let queue = SubscriptionQueue::new(EventType::ExecReport, 1);

        let first = event(&recycler, EventType::ExecReport, "BTC-USDT");
        queue.push_critical(first, Duration::from_millis(10)).await;

        let queue2 = Arc::clone(&queue);
        let popper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue2.try_pop()
        });

        let second = event(&recycler, EventType::ExecReport, "BTC-USDT");
        let outcome = queue.push_critical(second, Duration::from_millis(500)).await;
        assert!(matches!(outcome, CriticalPush::Delivered));

        let popped = popper.await.unwrap().unwrap();
        recycler.recycle_event(popped);
        recycler.recycle_events(queue.close());
        assert_eq!(recycler.live_events(), 0);
    }

    #[tokio::test]
    async fn test_pop_returns_none_after_close() {
        let recycler = Recycler::with_defaults();
        let queue = SubscriptionQueue::new(EventType::Trade, 4);
        let buffered = queue.close();
        assert!(buffered.is_empty());
        assert!(queue.pop().await.is_none());
        drop(recycler);
    }
}
