//! Recycle-once property: for any sequence of publishes with K total
//! deliveries (originals plus fan-out duplicates), exactly K pool returns
//! occur. Runs the bus with a debug-mode recycler so a double return
//! panics naming the offending pointer.

use std::sync::Arc;

use proptest::prelude::*;

use trading_engine_core::{
    bus::EventBus,
    config::BusConfig,
    event::{EventPayload, EventType, PoolConfig, Recycler},
};

fn market_types() -> impl Strategy<Value = EventType> {
    prop::sample::select(vec![
        EventType::Trade,
        EventType::Ticker,
        EventType::BookSnapshot,
        EventType::KlineSummary,
        EventType::ExecReport,
        EventType::BalanceUpdate,
    ])
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, ..ProptestConfig::default() })]

    #[test]
    fn recycle_happens_exactly_once_per_delivery(
        subscribers in 1usize..32,
        events in prop::collection::vec((market_types(), 0u64..8), 1..200),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async move {
            let recycler = Arc::new(Recycler::new(
                PoolConfig { max_live: 16_384, max_idle: 4096, preallocate: 0 },
                PoolConfig::default(),
                true,
            ));
            let bus = EventBus::new(
                BusConfig {
                    // Large enough that nothing coalesces or drops; every
                    // delivery reaches a consumer.
                    market_data_capacity: 4096,
                    critical_capacity: 8192,
                    ..BusConfig::default()
                },
                Arc::clone(&recycler),
            );

            let mut receivers = Vec::new();
            for event_type in [
                EventType::Trade,
                EventType::Ticker,
                EventType::BookSnapshot,
                EventType::KlineSummary,
                EventType::ExecReport,
                EventType::BalanceUpdate,
            ] {
                for _ in 0..subscribers {
                    let (_id, rx) = bus.subscribe(event_type).expect("subscribe");
                    receivers.push(rx);
                }
            }

            for (event_type, symbol_seed) in &events {
                let mut event = recycler.acquire_event().expect("acquire");
                event.provider = "okx-spot".to_string();
                event.symbol = format!("SYM{symbol_seed}-USDT");
                event.event_type = *event_type;
                if *event_type == EventType::Trade {
                    event.payload = EventPayload::Trade {
                        trade_id: "t".to_string(),
                        price: "1".to_string(),
                        quantity: "1".to_string(),
                        side: None,
                    };
                }
                bus.publish(event).await.expect("publish");
            }

            // Consume and recycle every delivered copy.
            let mut delivered = 0usize;
            for rx in receivers.iter_mut() {
                while let Some(event) = rx.try_recv() {
                    delivered += 1;
                    recycler.recycle_event(event);
                }
            }
            prop_assert_eq!(delivered, events.len() * subscribers);
            prop_assert_eq!(recycler.live_events(), 0);
            Ok(())
        })?;
    }
}
