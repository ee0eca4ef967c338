//! # Dispatch Table & Route Registrar
//!
//! The dispatch table maps `(provider, event type)` to a [`Route`] (WS
//! topics, REST poller specs, filter rules) and tracks which strategy
//! instances declared interest with which filters. It is mutable while the
//! pipeline runs: writers replace an immutable snapshot behind an
//! [`arc_swap::ArcSwap`] pointer, so readers never take a lock and always
//! observe a consistent version.
//!
//! The [`registrar`] sits on top of the table and bridges route interest to
//! the provider adapters: the first interested instance triggers the
//! provider subscribe (or poller start), the last one leaving triggers the
//! unsubscribe.

pub mod filter;
pub mod registrar;

pub use filter::{EventView, FilterOp, FilterRule};
pub use registrar::{InstanceRegistration, RouteDeclaration, RouteRegistrar};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::event::{Event, EventType};

/// REST polling fallback for data a provider does not stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestPollerSpec {
    pub name: String,
    pub endpoint: String,
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Registered parser id applied to poll responses
    pub parser: String,
}

impl RestPollerSpec {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.endpoint.trim().is_empty() {
            return Err(EngineError::InvalidRoute {
                message: "rest poller requires name and endpoint".to_string(),
            });
        }
        if self.interval.is_zero() {
            return Err(EngineError::InvalidRoute {
                message: format!("rest poller {}: interval must be positive", self.name),
            });
        }
        if self.parser.trim().is_empty() {
            return Err(EngineError::InvalidRoute {
                message: format!("rest poller {}: parser must be set", self.name),
            });
        }
        Ok(())
    }
}

/// Routing entry for one `(provider, event type)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub provider: String,
    pub event_type: EventType,
    pub ws_topics: Vec<String>,
    pub rest_pollers: Vec<RestPollerSpec>,
    pub filters: Vec<FilterRule>,
}

impl Route {
    pub fn validate(&self) -> Result<()> {
        if self.provider.trim().is_empty() {
            return Err(EngineError::InvalidRoute {
                message: "route requires a provider".to_string(),
            });
        }
        if self.ws_topics.is_empty() && self.rest_pollers.is_empty() {
            return Err(EngineError::InvalidRoute {
                message: format!(
                    "route {}/{} declares neither ws topics nor rest pollers",
                    self.provider, self.event_type
                ),
            });
        }
        if self.ws_topics.iter().any(|t| t.trim().is_empty()) {
            return Err(EngineError::InvalidRoute {
                message: format!("route {}/{} has an empty ws topic", self.provider, self.event_type),
            });
        }
        for poller in &self.rest_pollers {
            poller.validate()?;
        }
        for rule in &self.filters {
            rule.validate()?;
        }
        Ok(())
    }

    /// Conventional market topic name for a `(type, symbol)` pair.
    pub fn market_topic(event_type: EventType, symbol: &str) -> String {
        format!("{}:{}", event_type, symbol)
    }
}

type RouteKey = (String, EventType);

/// Filter interest one instance declared for a `(provider, type)` key.
#[derive(Debug, Clone)]
struct InstanceBinding {
    instance_id: String,
    filters: Vec<FilterRule>,
}

#[derive(Default)]
struct TableSnapshot {
    version: u64,
    routes: HashMap<RouteKey, Arc<Route>>,
    bindings: HashMap<RouteKey, Vec<InstanceBinding>>,
}

/// Versioned, snapshot-read dispatch table.
pub struct DispatchTable {
    snapshot: ArcSwap<TableSnapshot>,
    write: Mutex<()>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(TableSnapshot::default()),
            write: Mutex::new(()),
        }
    }

    /// Current table version; bumped by every successful mutation.
    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Validate and atomically install a route, replacing any prior entry
    /// for the same `(provider, type)`. Returns the new table version.
    pub fn upsert(&self, route: Route) -> Result<u64> {
        route.validate()?;
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot.load_full();
        let mut next = self.clone_snapshot(&current);
        next.version = current.version + 1;
        next.routes
            .insert((route.provider.clone(), route.event_type), Arc::new(route));
        let version = next.version;
        self.snapshot.store(Arc::new(next));
        Ok(version)
    }

    /// Remove a route. Idempotent: a missing key is a no-op and does not
    /// bump the version.
    pub fn remove(&self, provider: &str, event_type: EventType) {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot.load_full();
        let key = (provider.to_string(), event_type);
        if !current.routes.contains_key(&key) {
            return;
        }
        let mut next = self.clone_snapshot(&current);
        next.version = current.version + 1;
        next.routes.remove(&key);
        self.snapshot.store(Arc::new(next));
    }

    /// Lock-free lookup against the current snapshot.
    pub fn lookup(&self, provider: &str, event_type: EventType) -> Option<Arc<Route>> {
        let snapshot = self.snapshot.load();
        snapshot
            .routes
            .get(&(provider.to_string(), event_type))
            .cloned()
    }

    /// Declare an instance's filter interest for a `(provider, type)` key.
    /// Replaces any previous declaration by the same instance on that key.
    pub fn bind_instance(
        &self,
        instance_id: &str,
        provider: &str,
        event_type: EventType,
        filters: Vec<FilterRule>,
    ) -> Result<()> {
        for rule in &filters {
            rule.validate()?;
        }
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot.load_full();
        let mut next = self.clone_snapshot(&current);
        next.version = current.version + 1;
        let slot = next
            .bindings
            .entry((provider.to_string(), event_type))
            .or_default();
        slot.retain(|binding| binding.instance_id != instance_id);
        slot.push(InstanceBinding {
            instance_id: instance_id.to_string(),
            filters,
        });
        self.snapshot.store(Arc::new(next));
        Ok(())
    }

    /// Drop every binding the instance declared, across all keys.
    pub fn unbind_instance(&self, instance_id: &str) {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot.load_full();
        let mut next = self.clone_snapshot(&current);
        next.version = current.version + 1;
        for bindings in next.bindings.values_mut() {
            bindings.retain(|binding| binding.instance_id != instance_id);
        }
        next.bindings.retain(|_, bindings| !bindings.is_empty());
        self.snapshot.store(Arc::new(next));
    }

    /// Every instance whose declared filters match this event.
    pub fn match_event(&self, event: &Event) -> Vec<String> {
        let snapshot = self.snapshot.load();
        let key = (event.provider.clone(), event.event_type);
        let Some(bindings) = snapshot.bindings.get(&key) else {
            return Vec::new();
        };
        let view = EventView::from_event(event);
        bindings
            .iter()
            .filter(|binding| binding.filters.iter().all(|rule| rule.matches(&view)))
            .map(|binding| binding.instance_id.clone())
            .collect()
    }

    fn clone_snapshot(&self, current: &TableSnapshot) -> TableSnapshot {
        TableSnapshot {
            version: current.version,
            routes: current.routes.clone(),
            bindings: current.bindings.clone(),
        }
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use serde_json::json;

    fn ticker_route() -> Route {
        Route {
            provider: "okx-spot".to_string(),
            event_type: EventType::Ticker,
            ws_topics: vec![Route::market_topic(EventType::Ticker, "BTC-USDT")],
            rest_pollers: vec![],
            filters: vec![],
        }
    }

    #[test]
    fn test_upsert_bumps_version_and_replaces() {
        let table = DispatchTable::new();
        assert_eq!(table.version(), 0);
        table.upsert(ticker_route()).unwrap();
        assert_eq!(table.version(), 1);

        let mut replacement = ticker_route();
        replacement.ws_topics = vec![Route::market_topic(EventType::Ticker, "ETH-USDT")];
        table.upsert(replacement.clone()).unwrap();
        assert_eq!(table.version(), 2);

        let found = table.lookup("okx-spot", EventType::Ticker).unwrap();
        assert_eq!(found.ws_topics, replacement.ws_topics);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = DispatchTable::new();
        table.upsert(ticker_route()).unwrap();
        table.remove("okx-spot", EventType::Ticker);
        let version = table.version();
        table.remove("okx-spot", EventType::Ticker);
        assert_eq!(table.version(), version);
        assert!(table.lookup("okx-spot", EventType::Ticker).is_none());
    }

    #[test]
    fn test_upsert_rejects_empty_routes() {
        let table = DispatchTable::new();
        let route = Route {
            provider: "okx-spot".to_string(),
            event_type: EventType::Trade,
            ws_topics: vec![],
            rest_pollers: vec![],
            filters: vec![],
        };
        assert!(matches!(
            table.upsert(route),
            Err(EngineError::InvalidRoute { .. })
        ));
    }

    #[test]
    fn test_upsert_rejects_zero_interval_poller() {
        let table = DispatchTable::new();
        let route = Route {
            provider: "okx-spot".to_string(),
            event_type: EventType::Ticker,
            ws_topics: vec![],
            rest_pollers: vec![RestPollerSpec {
                name: "ticker-poll".to_string(),
                endpoint: "/v5/market/ticker".to_string(),
                interval: Duration::ZERO,
                parser: "ticker".to_string(),
            }],
            filters: vec![],
        };
        assert!(table.upsert(route).is_err());
    }

    #[test]
    fn test_match_event_respects_instance_filters() {
        let table = DispatchTable::new();
        table
            .bind_instance(
                "alpha",
                "okx-spot",
                EventType::Trade,
                vec![FilterRule::one_of(
                    "instrument",
                    vec![json!("BTC-USDT"), json!("ETH-USDT")],
                )],
            )
            .unwrap();
        table
            .bind_instance("beta", "okx-spot", EventType::Trade, vec![])
            .unwrap();

        let mut event = Event::default();
        event.provider = "okx-spot".to_string();
        event.symbol = "BTC-USDT".to_string();
        event.event_type = EventType::Trade;
        event.payload = EventPayload::Trade {
            trade_id: "1".to_string(),
            price: "9".to_string(),
            quantity: "1".to_string(),
            side: None,
        };

        let mut matched = table.match_event(&event);
        matched.sort();
        assert_eq!(matched, vec!["alpha".to_string(), "beta".to_string()]);

        event.symbol = "SOL-USDT".to_string();
        let matched = table.match_event(&event);
        assert_eq!(matched, vec!["beta".to_string()]);
    }

    #[test]
    fn test_unbind_instance_clears_all_keys() {
        let table = DispatchTable::new();
        table
            .bind_instance("alpha", "okx-spot", EventType::Trade, vec![])
            .unwrap();
        table
            .bind_instance("alpha", "okx-spot", EventType::Ticker, vec![])
            .unwrap();
        table.unbind_instance("alpha");

        let mut event = Event::default();
        event.provider = "okx-spot".to_string();
        event.event_type = EventType::Trade;
        assert!(table.match_event(&event).is_empty());
    }
}
