//! Prometheus metrics for the distribution core.
//!
//! Compiled with the `monitoring` feature (default on); without it every
//! recording function is a no-op so call sites stay unconditional.

#[cfg(feature = "monitoring")]
mod inner {
    use once_cell::sync::Lazy;
    use prometheus::{IntCounter, IntCounterVec, Opts};

    pub struct EngineMetrics {
        pub events_published: IntCounter,
        pub fanout_duplicates: IntCounter,
        pub events_coalesced: IntCounter,
        pub events_dropped: IntCounter,
        pub dead_letters: IntCounter,
        pub pool_acquires: IntCounterVec,
        pub pool_recycles: IntCounterVec,
        pub risk_breaches: IntCounter,
    }

    impl EngineMetrics {
        fn register() -> Self {
            let registry = prometheus::default_registry();
            let events_published = IntCounter::with_opts(Opts::new(
                "engine_events_published_total",
                "Events accepted by the bus",
            ))
            .unwrap_or_else(|e| panic!("metric registration failed: {e}"));
            let fanout_duplicates = IntCounter::with_opts(Opts::new(
                "engine_fanout_duplicates_total",
                "Pool-allocated duplicates created during fan-out",
            ))
            .unwrap_or_else(|e| panic!("metric registration failed: {e}"));
            let events_coalesced = IntCounter::with_opts(Opts::new(
                "engine_events_coalesced_total",
                "Market-data events overwritten by a newer value of the same key",
            ))
            .unwrap_or_else(|e| panic!("metric registration failed: {e}"));
            let events_dropped = IntCounter::with_opts(Opts::new(
                "engine_events_dropped_total",
                "Market-data events dropped oldest-first on a full subscription",
            ))
            .unwrap_or_else(|e| panic!("metric registration failed: {e}"));
            let dead_letters = IntCounter::with_opts(Opts::new(
                "engine_dead_letters_total",
                "Critical events diverted to the dead-letter sink",
            ))
            .unwrap_or_else(|e| panic!("metric registration failed: {e}"));
            let pool_acquires = IntCounterVec::new(
                Opts::new("engine_pool_acquires_total", "Objects borrowed from pools"),
                &["resource"],
            )
            .unwrap_or_else(|e| panic!("metric registration failed: {e}"));
            let pool_recycles = IntCounterVec::new(
                Opts::new("engine_pool_recycles_total", "Objects returned through the recycler"),
                &["resource"],
            )
            .unwrap_or_else(|e| panic!("metric registration failed: {e}"));
            let risk_breaches = IntCounter::with_opts(Opts::new(
                "engine_risk_breaches_total",
                "Orders rejected by the risk manager",
            ))
            .unwrap_or_else(|e| panic!("metric registration failed: {e}"));

            // Registration conflicts only happen when two engines share a
            // process-wide registry; keep the first registration in that case.
            let _ = registry.register(Box::new(events_published.clone()));
            let _ = registry.register(Box::new(fanout_duplicates.clone()));
            let _ = registry.register(Box::new(events_coalesced.clone()));
            let _ = registry.register(Box::new(events_dropped.clone()));
            let _ = registry.register(Box::new(dead_letters.clone()));
            let _ = registry.register(Box::new(pool_acquires.clone()));
            let _ = registry.register(Box::new(pool_recycles.clone()));
            let _ = registry.register(Box::new(risk_breaches.clone()));

            Self {
                events_published,
                fanout_duplicates,
                events_coalesced,
                events_dropped,
                dead_letters,
                pool_acquires,
                pool_recycles,
                risk_breaches,
            }
        }
    }

    pub static METRICS: Lazy<EngineMetrics> = Lazy::new(EngineMetrics::register);
}

#[cfg(feature = "monitoring")]
pub fn record_publish() {
    inner::METRICS.events_published.inc();
}

#[cfg(feature = "monitoring")]
pub fn record_fanout_duplicates(count: u64) {
    inner::METRICS.fanout_duplicates.inc_by(count);
}

#[cfg(feature = "monitoring")]
pub fn record_coalesced() {
    inner::METRICS.events_coalesced.inc();
}

#[cfg(feature = "monitoring")]
pub fn record_dropped() {
    inner::METRICS.events_dropped.inc();
}

#[cfg(feature = "monitoring")]
pub fn record_dead_letter() {
    inner::METRICS.dead_letters.inc();
}

#[cfg(feature = "monitoring")]
pub fn record_pool_acquire(resource: &str) {
    inner::METRICS.pool_acquires.with_label_values(&[resource]).inc();
}

#[cfg(feature = "monitoring")]
pub fn record_pool_recycle(resource: &str) {
    inner::METRICS.pool_recycles.with_label_values(&[resource]).inc();
}

#[cfg(feature = "monitoring")]
pub fn record_risk_breach() {
    inner::METRICS.risk_breaches.inc();
}

#[cfg(not(feature = "monitoring"))]
pub fn record_publish() {}
#[cfg(not(feature = "monitoring"))]
pub fn record_fanout_duplicates(_count: u64) {}
#[cfg(not(feature = "monitoring"))]
pub fn record_coalesced() {}
#[cfg(not(feature = "monitoring"))]
pub fn record_dropped() {}
#[cfg(not(feature = "monitoring"))]
pub fn record_dead_letter() {}
#[cfg(not(feature = "monitoring"))]
pub fn record_pool_acquire(_resource: &str) {}
#[cfg(not(feature = "monitoring"))]
pub fn record_pool_recycle(_resource: &str) {}
#[cfg(not(feature = "monitoring"))]
pub fn record_risk_breach() {}
