//! # Lifecycle Recycler
//!
//! Process-wide gateway for returning pooled records. Every borrow taken
//! through [`Recycler::acquire_event`] or [`Recycler::acquire_order_request`]
//! must be returned through the matching `recycle_*` method exactly once;
//! the underlying pools are not reachable from outside this module, so the
//! gateway is the only way back in.
//!
//! In debug mode the recycler tracks borrowed pointer addresses in a
//! concurrent set and writes a poison sentinel into every reset record. A
//! repeat return of the same pointer is a programmer error and panics,
//! naming the duplicate pointer. Debug mode is off by default.

use dashmap::DashSet;
use tracing::trace;

use crate::error::Result;
use crate::event::pool::{ObjectPool, PoolConfig};
use crate::event::{Event, OrderRequest, Recyclable};

/// Central recycle gateway owning the event and order-request pools.
pub struct Recycler {
    events: ObjectPool<Event>,
    orders: ObjectPool<OrderRequest>,
    /// Borrowed pointer addresses, present only in debug mode
    borrowed: Option<DashSet<usize>>,
}

impl Recycler {
    /// Build a recycler with per-type pool limits. `debug` enables borrow
    /// tracking and poison sentinels; leave it off in production.
    pub fn new(event_pool: PoolConfig, order_pool: PoolConfig, debug: bool) -> Self {
        Self {
            events: ObjectPool::new(event_pool),
            orders: ObjectPool::new(order_pool),
            borrowed: debug.then(DashSet::new),
        }
    }

    /// Recycler with default pool limits and debug mode off.
    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default(), PoolConfig::default(), false)
    }

    /// Whether debug borrow tracking is active.
    pub fn debug_mode(&self) -> bool {
        self.borrowed.is_some()
    }

    /// Borrow an event from the pool.
    pub fn acquire_event(&self) -> Result<Box<Event>> {
        let event = self.events.acquire()?;
        self.track_borrow(event.as_ref() as *const Event as usize);
        crate::metrics::record_pool_acquire("event");
        Ok(event)
    }

    /// Borrow an order request from the pool.
    pub fn acquire_order_request(&self) -> Result<Box<OrderRequest>> {
        let request = self.orders.acquire()?;
        self.track_borrow(request.as_ref() as *const OrderRequest as usize);
        crate::metrics::record_pool_acquire("order_request");
        Ok(request)
    }

    /// Return an event to the pool, zeroing it first.
    pub fn recycle_event(&self, mut event: Box<Event>) {
        self.track_return(event.as_ref() as *const Event as usize);
        event.reset();
        if self.debug_mode() {
            event.poison();
        }
        self.events.release(event);
        crate::metrics::record_pool_recycle("event");
    }

    /// Bulk form of [`recycle_event`](Self::recycle_event), used by
    /// partial-failure cleanup and shutdown drains.
    pub fn recycle_events(&self, events: Vec<Box<Event>>) {
        for event in events {
            self.recycle_event(event);
        }
    }

    /// Return an order request to the pool, zeroing it first.
    pub fn recycle_order_request(&self, mut request: Box<OrderRequest>) {
        self.track_return(request.as_ref() as *const OrderRequest as usize);
        request.reset();
        if self.debug_mode() {
            request.poison();
        }
        self.orders.release(request);
        crate::metrics::record_pool_recycle("order_request");
    }

    /// Events currently borrowed and not yet recycled.
    pub fn live_events(&self) -> usize {
        self.events.live()
    }

    /// Order requests currently borrowed and not yet recycled.
    pub fn live_order_requests(&self) -> usize {
        self.orders.live()
    }

    fn track_borrow(&self, addr: usize) {
        if let Some(borrowed) = &self.borrowed {
            if !borrowed.insert(addr) {
                panic!("recycler: pool handed out live pointer {addr:#x} twice");
            }
            trace!(addr = format_args!("{addr:#x}"), "recycler borrow");
        }
    }

    fn track_return(&self, addr: usize) {
        if let Some(borrowed) = &self.borrowed {
            if borrowed.remove(&addr).is_none() {
                panic!("recycler: double recycle of pointer {addr:#x}");
            }
            trace!(addr = format_args!("{addr:#x}"), "recycler return");
        }
    }
}

impl Default for Recycler {
    fn default() -> Self {
        Self::with_defaults()
    }
}
