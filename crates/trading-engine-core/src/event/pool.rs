//! Bounded object pool backing the event and order-request lifecycles.
//!
//! The pool is deliberately dumb: it hands out boxed records and takes them
//! back. All reset/poison bookkeeping lives in the
//! [`Recycler`](super::recycler::Recycler), which is the only module able to
//! return objects (`release` is not exported beyond the `event` module).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::event::Recyclable;

/// Object pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Ceiling on simultaneously borrowed objects; `acquire` fails with
    /// `PoolExhausted` once reached
    pub max_live: usize,
    /// Idle objects retained for reuse; excess returns are dropped
    pub max_idle: usize,
    /// Objects allocated eagerly at construction
    pub preallocate: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_live: 4096,
            max_idle: 1024,
            preallocate: 64,
        }
    }
}

pub(crate) struct ObjectPool<T: Recyclable> {
    idle: Mutex<Vec<Box<T>>>,
    live: AtomicUsize,
    config: PoolConfig,
}

impl<T: Recyclable> ObjectPool<T> {
    pub(crate) fn new(config: PoolConfig) -> Self {
        let prealloc = config.preallocate.min(config.max_idle);
        let idle = (0..prealloc).map(|_| Box::new(T::default())).collect();
        Self {
            idle: Mutex::new(idle),
            live: AtomicUsize::new(0),
            config,
        }
    }

    /// Borrow an object, reusing an idle one when available.
    pub(crate) fn acquire(&self) -> Result<Box<T>> {
        let prior = self.live.fetch_add(1, Ordering::AcqRel);
        if prior >= self.config.max_live {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return Err(EngineError::PoolExhausted {
                resource: T::RESOURCE,
            });
        }
        let reused = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.pop()
        };
        Ok(reused.unwrap_or_default())
    }

    /// Return an object to the idle list. Callers reset it first; the pool
    /// only enforces the idle ceiling and the live count.
    pub(super) fn release(&self, obj: Box<T>) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.config.max_idle {
            idle.push(obj);
        }
    }

    /// Outstanding borrows.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}
