//! Dead-letter sink for critical events that could not be delivered.
//!
//! Critical events are never silently dropped: when a bounded wait on a
//! full critical subscription expires, or a critical subscription closes
//! with events still buffered, a summary of the event is recorded here
//! before the record itself is recycled. The sink keeps a bounded ring for
//! inspection plus a monotonic total for metrics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{Event, EventType};

/// Why an event was diverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadLetterReason {
    /// The bounded wait on a full critical subscription expired
    SendTimeout,
    /// The subscription closed with the event still buffered
    SubscriptionClosed,
}

/// Summary of a diverted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event_id: u64,
    pub event_type: EventType,
    pub provider: String,
    pub symbol: String,
    pub routing_version: u64,
    pub subscription_id: Uuid,
    pub reason: DeadLetterReason,
    pub occurred_at: DateTime<Utc>,
}

/// Bounded in-memory dead-letter sink.
pub struct DeadLetterSink {
    ring: Mutex<VecDeque<DeadLetterEntry>>,
    capacity: usize,
    total: AtomicU64,
}

impl DeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            total: AtomicU64::new(0),
        }
    }

    /// Record a diverted event. The caller recycles the record afterwards.
    pub fn record(&self, event: &Event, subscription_id: Uuid, reason: DeadLetterReason) {
        let entry = DeadLetterEntry {
            event_id: event.event_id,
            event_type: event.event_type,
            provider: event.provider.clone(),
            symbol: event.symbol.clone(),
            routing_version: event.routing_version,
            subscription_id,
            reason,
            occurred_at: Utc::now(),
        };
        tracing::warn!(
            event_type = %entry.event_type,
            provider = %entry.provider,
            symbol = %entry.symbol,
            subscription = %subscription_id,
            reason = ?reason,
            "critical event diverted to dead letter"
        );
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
        self.total.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_dead_letter();
    }

    /// Remove and return everything currently retained.
    pub fn drain(&self) -> Vec<DeadLetterEntry> {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.drain(..).collect()
    }

    /// Entries currently retained in the ring.
    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Diversions since construction, unaffected by `drain`.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            event_id: 11,
            provider: "okx-spot".to_string(),
            symbol: "BTC-USDT".to_string(),
            event_type: EventType::ExecReport,
            ..Event::default()
        }
    }

    #[test]
    fn test_ring_is_bounded() {
        let sink = DeadLetterSink::new(2);
        let event = sample_event();
        for _ in 0..5 {
            sink.record(&event, Uuid::new_v4(), DeadLetterReason::SendTimeout);
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.total(), 5);
    }

    #[test]
    fn test_drain_empties_ring_but_keeps_total() {
        let sink = DeadLetterSink::new(8);
        let event = sample_event();
        sink.record(&event, Uuid::new_v4(), DeadLetterReason::SubscriptionClosed);
        let drained = sink.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].reason, DeadLetterReason::SubscriptionClosed);
        assert!(sink.is_empty());
        assert_eq!(sink.total(), 1);
    }
}
