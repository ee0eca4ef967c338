//! Distribution-core configuration.
//!
//! Mirrors the layered-config idiom used across the workspace: every knob
//! has a production-safe default, structs serialize for control-plane
//! echoing, and builders stay out of the hot path.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::PoolConfig;

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Queue capacity for market-data subscriptions
    pub market_data_capacity: usize,
    /// Queue capacity for critical subscriptions; strictly larger than the
    /// market-data bound by contract
    pub critical_capacity: usize,
    /// Bounded wait for a full critical subscription before diverting the
    /// event to the dead-letter sink
    #[serde(with = "humantime_millis")]
    pub critical_send_timeout: Duration,
    /// Ceiling on concurrent duplicate creation during fan-out
    pub fanout_workers: usize,
    /// Entries retained by the dead-letter sink's inspection ring
    pub dead_letter_ring: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            market_data_capacity: 256,
            critical_capacity: 1024,
            critical_send_timeout: Duration::from_millis(250),
            fanout_workers: 8,
            dead_letter_ring: 512,
        }
    }
}

/// Top-level engine configuration grouping the distribution knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub bus: BusConfig,
    pub event_pool: PoolConfig,
    pub order_pool: PoolConfig,
    /// Enables the recycler's borrow tracking and poison sentinels
    pub recycler_debug: bool,
}

impl EngineConfig {
    /// Build the recycler this configuration describes.
    pub fn build_recycler(&self) -> crate::event::Recycler {
        crate::event::Recycler::new(
            self.event_pool.clone(),
            self.order_pool.clone(),
            self.recycler_debug,
        )
    }

    /// Build an event bus over an already-shared recycler.
    pub fn build_bus(&self, recycler: std::sync::Arc<crate::event::Recycler>) -> crate::bus::EventBus {
        crate::bus::EventBus::new(self.bus.clone(), recycler)
    }
}

/// Serialize `Duration` as integer milliseconds for config files.
mod humantime_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
