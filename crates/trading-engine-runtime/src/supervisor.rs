//! # Per-Instance Strategy Supervisor
//!
//! The supervisor owns one running strategy instance: its bus
//! subscriptions, provider/symbol filtering, market-state snapshot, and
//! the order-submission path. One consumer task runs per subscribed event
//! type, reading until context cancellation or channel close; every event
//! popped from a subscription is recycled exactly once on all exit paths,
//! including a panicking handler.
//!
//! A handler panic is recovered, converted into a logged error on the
//! instance's error stream, and the consumer continues with the next
//! event.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trading_engine_core::bus::{EventBus, EventReceiver};
use trading_engine_core::error::{EngineError, Result};
use trading_engine_core::event::{
    Event, EventPayload, EventType, ExecState, OrderRequest, OrderSide, OrderType, Recycler,
    SubscriptionClass, TimeInForce,
};
use trading_engine_core::provider::OrderRouter;

use crate::handler::{MarketStateSnapshot, StrategyHandler, StrategyRuntime};
use crate::risk::{RiskBreach, RiskManager};
use crate::spec::InstanceSpec;

/// Atomically published last/bid/ask prices. NaN bits mark unset slots.
struct MarketState {
    last: AtomicU64,
    bid: AtomicU64,
    ask: AtomicU64,
}

impl MarketState {
    fn new() -> Self {
        let unset = f64::NAN.to_bits();
        Self {
            last: AtomicU64::new(unset),
            bid: AtomicU64::new(unset),
            ask: AtomicU64::new(unset),
        }
    }

    fn store(slot: &AtomicU64, value: f64) {
        slot.store(value.to_bits(), Ordering::Release);
    }

    fn load(slot: &AtomicU64) -> Option<f64> {
        let value = f64::from_bits(slot.load(Ordering::Acquire));
        (!value.is_nan()).then_some(value)
    }
}

/// Shared state of one instance: identity, derived symbol topology,
/// market snapshot, and the order path. Handlers hold this as their
/// [`StrategyRuntime`].
pub struct SupervisorCore {
    id: String,
    providers: Vec<String>,
    provider_set: HashSet<String>,
    provider_symbols: HashMap<String, HashSet<String>>,
    default_symbols: HashMap<String, String>,
    all_symbols: Vec<String>,
    global_primary: String,
    base_currency: String,
    quote_currency: String,
    balance_currencies: HashSet<String>,
    market: MarketState,
    trading_active: AtomicBool,
    dry_run: AtomicBool,
    order_count: AtomicU64,
    min_accept_version: AtomicU64,
    bus: EventBus,
    risk: Arc<dyn RiskManager>,
    router: Arc<dyn OrderRouter>,
}

impl SupervisorCore {
    pub fn new(
        spec: &InstanceSpec,
        bus: EventBus,
        risk: Arc<dyn RiskManager>,
        router: Arc<dyn OrderRouter>,
    ) -> Arc<Self> {
        let providers = spec.providers.clone();
        let provider_set: HashSet<String> = providers.iter().cloned().collect();

        let mut provider_symbols = HashMap::new();
        let mut default_symbols = HashMap::new();
        for provider in &providers {
            let symbols = spec.symbols_for(provider);
            provider_symbols.insert(provider.clone(), symbols.iter().cloned().collect());
            if let Some(first) = symbols.first() {
                default_symbols.insert(provider.clone(), first.clone());
            }
        }

        let all_symbols = spec.all_symbols();
        let global_primary = providers
            .iter()
            .filter_map(|provider| spec.symbols_for(provider).first())
            .next()
            .cloned()
            .unwrap_or_default();

        let (base_currency, quote_currency) = match global_primary.split_once('-') {
            Some((base, quote)) => (base.to_string(), quote.to_string()),
            None => (global_primary.clone(), String::new()),
        };

        let mut balance_currencies = HashSet::new();
        for symbol in &all_symbols {
            for part in symbol.split('-') {
                if !part.is_empty() {
                    balance_currencies.insert(part.to_string());
                }
            }
        }

        Arc::new(Self {
            id: spec.id.clone(),
            providers,
            provider_set,
            provider_symbols,
            default_symbols,
            all_symbols,
            global_primary,
            base_currency,
            quote_currency,
            balance_currencies,
            market: MarketState::new(),
            trading_active: AtomicBool::new(false),
            dry_run: AtomicBool::new(spec.strategy.dry_run()),
            order_count: AtomicU64::new(0),
            min_accept_version: AtomicU64::new(0),
            bus,
            risk,
            router,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn recycler(&self) -> &Arc<Recycler> {
        self.bus.recycler()
    }

    pub fn all_symbols(&self) -> &[String] {
        &self.all_symbols
    }

    pub fn global_primary(&self) -> &str {
        &self.global_primary
    }

    pub fn base_currency(&self) -> &str {
        &self.base_currency
    }

    pub fn quote_currency(&self) -> &str {
        &self.quote_currency
    }

    pub fn order_count(&self) -> u64 {
        self.order_count.load(Ordering::Acquire)
    }

    pub fn set_trading_active(&self, active: bool) {
        self.trading_active.store(active, Ordering::Release);
    }

    pub fn set_dry_run(&self, dry_run: bool) {
        self.dry_run.store(dry_run, Ordering::Release);
    }

    /// Market-data events stamped below this routing version are discarded
    /// at dispatch entry. Critical events bypass the gate.
    pub fn set_min_accept_version(&self, version: u64) {
        self.min_accept_version.store(version, Ordering::Release);
    }

    /// Ownership test: the id prefix of a client order id.
    pub fn is_my_order(&self, client_order_id: &str) -> bool {
        client_order_id
            .strip_prefix(self.id.as_str())
            .map(|rest| rest.starts_with('-'))
            .unwrap_or(false)
    }

    /// Filter, update market state, and dispatch one event to the handler.
    /// Returning `Ok` includes silently filtered events; the caller owns
    /// the recycle either way.
    async fn dispatch(&self, handler: &Arc<dyn StrategyHandler>, event: &Event) -> Result<()> {
        if event.event_type.class() == SubscriptionClass::MarketData
            && event.routing_version < self.min_accept_version.load(Ordering::Acquire)
        {
            return Ok(());
        }

        if !self.provider_set.is_empty() && !self.provider_set.contains(&event.provider) {
            return Ok(());
        }

        if event.event_type == EventType::BalanceUpdate {
            // The symbol field of a balance update carries a currency code.
            if !self.balance_currencies.contains(&event.symbol) {
                return Ok(());
            }
        } else {
            let accept = match self.provider_symbols.get(&event.provider) {
                Some(symbols) => symbols.is_empty() || symbols.contains(&event.symbol),
                None => true,
            };
            if !accept {
                return Ok(());
            }
        }

        self.observe_market(event);

        match event.event_type {
            EventType::Trade => handler.on_trade(event).await,
            EventType::Ticker => handler.on_ticker(event).await,
            EventType::BookSnapshot => handler.on_book_snapshot(event).await,
            EventType::KlineSummary => handler.on_kline_summary(event).await,
            EventType::InstrumentUpdate => handler.on_instrument_update(event).await,
            EventType::BalanceUpdate => handler.on_balance_update(event).await,
            EventType::RiskControl => handler.on_risk_control(event).await,
            EventType::Extension => handler.on_extension_event(event).await,
            EventType::ExecReport => self.dispatch_exec_report(handler, event).await,
        }
    }

    async fn dispatch_exec_report(
        &self,
        handler: &Arc<dyn StrategyHandler>,
        event: &Event,
    ) -> Result<()> {
        let EventPayload::ExecReport {
            client_order_id,
            state,
            reject_reason,
            ..
        } = &event.payload
        else {
            return Ok(());
        };
        if !self.is_my_order(client_order_id) {
            return Ok(());
        }
        match state {
            ExecState::Filled => handler.on_order_filled(event).await,
            ExecState::Rejected => {
                handler
                    .on_order_rejected(event, reject_reason.as_deref())
                    .await
            }
            ExecState::Partial => handler.on_order_partial_fill(event).await,
            ExecState::Cancelled => handler.on_order_cancelled(event).await,
            ExecState::Ack => handler.on_order_acknowledged(event).await,
            ExecState::Expired => handler.on_order_expired(event).await,
        }
    }

    /// Maintain the market snapshot and feed observations to risk.
    fn observe_market(&self, event: &Event) {
        match &event.payload {
            EventPayload::Trade { price, .. } => {
                if let Ok(price) = price.parse::<f64>() {
                    MarketState::store(&self.market.last, price);
                    self.risk.observe_price(&event.provider, &event.symbol, price);
                }
            }
            EventPayload::Ticker {
                last_price,
                bid_price,
                ask_price,
            } => {
                if let Ok(last) = last_price.parse::<f64>() {
                    MarketState::store(&self.market.last, last);
                }
                let bid = bid_price.parse::<f64>().ok();
                let ask = ask_price.parse::<f64>().ok();
                if let Some(bid) = bid {
                    MarketState::store(&self.market.bid, bid);
                }
                if let Some(ask) = ask {
                    MarketState::store(&self.market.ask, ask);
                }
                if let (Some(bid), Some(ask)) = (bid, ask) {
                    self.risk
                        .observe_price(&event.provider, &event.symbol, (bid + ask) / 2.0);
                }
            }
            EventPayload::BookSnapshot { bids, asks } => {
                let bid = bids.first().and_then(|level| level.price.parse::<f64>().ok());
                let ask = asks.first().and_then(|level| level.price.parse::<f64>().ok());
                if let Some(bid) = bid {
                    MarketState::store(&self.market.bid, bid);
                }
                if let Some(ask) = ask {
                    MarketState::store(&self.market.ask, ask);
                }
                if let (Some(bid), Some(ask)) = (bid, ask) {
                    self.risk
                        .observe_price(&event.provider, &event.symbol, (bid + ask) / 2.0);
                }
            }
            _ => {}
        }
    }

    async fn submit(
        &self,
        provider: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
        time_in_force: TimeInForce,
    ) -> Result<()> {
        if self.providers.is_empty() {
            return Err(EngineError::NoProvidersConfigured);
        }
        if !self.provider_set.contains(provider) {
            return Err(EngineError::InvalidSpec {
                message: format!("provider {provider:?} is not configured for instance {}", self.id),
            });
        }
        if self.dry_run.load(Ordering::Acquire) {
            info!(
                instance = %self.id,
                provider,
                side = ?side,
                %quantity,
                price = ?price,
                order_type = ?order_type,
                "dry run: order not routed"
            );
            return Ok(());
        }

        let mut request = self.recycler().acquire_order_request()?;
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let count = self.order_count.load(Ordering::Acquire);
        request.client_order_id = format!("{}-{}-{}", self.id, now, count);
        request.consumer_id = self.id.clone();
        request.provider = provider.to_string();
        request.symbol = self
            .default_symbols
            .get(provider)
            .cloned()
            .unwrap_or_else(|| self.global_primary.clone());
        request.side = side;
        request.order_type = order_type;
        request.price = price;
        request.quantity = quantity;
        request.time_in_force = time_in_force;
        request.timestamp = now;

        if let Err(breach) = self.risk.check_order(&request) {
            warn!(
                instance = %self.id,
                breach = %breach,
                kill_switch = breach.kill_switch,
                circuit_breaker = breach.circuit_breaker,
                "order rejected by risk check"
            );
            trading_engine_core::metrics::record_risk_breach();
            self.emit_risk_control(&request, &breach).await;
            let reason = breach.reason.clone();
            self.recycler().recycle_order_request(request);
            return Err(EngineError::RiskCheckFailed { reason });
        }

        let outcome = self.router.route_order(&request).await;
        if outcome.is_ok() {
            self.order_count.fetch_add(1, Ordering::AcqRel);
        }
        self.recycler().recycle_order_request(request);
        outcome
    }

    /// Broadcast a synthetic risk-control event so every consumer
    /// (telemetry, sibling strategies) observes the breach uniformly.
    async fn emit_risk_control(&self, request: &OrderRequest, breach: &RiskBreach) {
        let mut event = match self.recycler().acquire_event() {
            Ok(event) => event,
            Err(err) => {
                warn!(instance = %self.id, error = %err, "risk-control event allocation failed");
                return;
            }
        };
        event.provider = request.provider.clone();
        event.symbol = request.symbol.clone();
        event.event_type = EventType::RiskControl;
        event.ingest_ts = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        event.payload = EventPayload::RiskControl {
            breach_type: breach.breach_type.clone(),
            reason: breach.reason.clone(),
            metrics: breach.metrics.clone(),
            kill_switch: breach.kill_switch,
            circuit_breaker: breach.circuit_breaker,
            consumer_id: self.id.clone(),
        };
        if let Err(err) = self.bus.publish(event).await {
            warn!(instance = %self.id, error = %err, "risk-control event publish failed");
        }
    }
}

#[async_trait]
impl StrategyRuntime for SupervisorCore {
    fn instance_id(&self) -> &str {
        &self.id
    }

    fn providers(&self) -> Vec<String> {
        self.providers.clone()
    }

    fn is_trading_active(&self) -> bool {
        self.trading_active.load(Ordering::Acquire)
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Acquire)
    }

    fn market_state(&self) -> MarketStateSnapshot {
        MarketStateSnapshot {
            last_price: MarketState::load(&self.market.last),
            bid_price: MarketState::load(&self.market.bid),
            ask_price: MarketState::load(&self.market.ask),
        }
    }

    fn last_price(&self) -> Option<f64> {
        MarketState::load(&self.market.last)
    }

    fn bid_price(&self) -> Option<f64> {
        MarketState::load(&self.market.bid)
    }

    fn ask_price(&self) -> Option<f64> {
        MarketState::load(&self.market.ask)
    }

    fn select_provider(&self, seed: u64) -> Result<String> {
        if self.providers.is_empty() {
            return Err(EngineError::NoProvidersConfigured);
        }
        let index = (seed % self.providers.len() as u64) as usize;
        Ok(self.providers[index].clone())
    }

    async fn submit_order(
        &self,
        provider: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<()> {
        self.submit(
            provider,
            side,
            quantity,
            Some(price),
            OrderType::Limit,
            TimeInForce::Gtc,
        )
        .await
    }

    async fn submit_market_order(
        &self,
        provider: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<()> {
        self.submit(
            provider,
            side,
            quantity,
            None,
            OrderType::Market,
            TimeInForce::Ioc,
        )
        .await
    }
}

/// A started instance: its consumer tasks and cancellation handle.
pub struct Supervisor {
    core: Arc<SupervisorCore>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Subscribe to every declared event type and spawn one consumer task
    /// per subscription. A subscription failure unwinds the ones already
    /// made. Background failures arrive on the returned error stream,
    /// which closes after every consumer has exited.
    pub fn start(
        core: Arc<SupervisorCore>,
        handler: Arc<dyn StrategyHandler>,
        events: &[EventType],
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EngineError>)> {
        let mut receivers = Vec::with_capacity(events.len());
        for event_type in events {
            match core.bus().subscribe(*event_type) {
                Ok((_, receiver)) => receivers.push(receiver),
                Err(err) => {
                    for receiver in receivers {
                        core.bus().unsubscribe(receiver.subscription_id());
                    }
                    return Err(err);
                }
            }
        }

        core.set_trading_active(true);
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let tasks = receivers
            .into_iter()
            .map(|receiver| {
                tokio::spawn(consume(
                    Arc::clone(&core),
                    Arc::clone(&handler),
                    receiver,
                    cancel.clone(),
                    error_tx.clone(),
                ))
            })
            .collect();

        info!(instance = %core.id(), subscriptions = events.len(), "supervisor started");
        Ok((Self { core, cancel, tasks }, error_rx))
    }

    pub fn core(&self) -> &Arc<SupervisorCore> {
        &self.core
    }

    /// Initiate shutdown. Consumers drain their queues and exit; await
    /// [`join`](Self::join) for completion.
    pub fn cancel(&self) {
        self.core.set_trading_active(false);
        self.cancel.cancel();
    }

    /// Wait for every consumer task to exit.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(instance = %self.core.id(), error = %err, "consumer task aborted");
            }
        }
        debug!(instance = %self.core.id(), "supervisor stopped");
    }
}

/// One consumer task: read until cancel or close, dispatch, recycle;
/// drain buffered events on the way out so nothing leaks from the pool.
async fn consume(
    core: Arc<SupervisorCore>,
    handler: Arc<dyn StrategyHandler>,
    mut receiver: EventReceiver,
    cancel: CancellationToken,
    errors: mpsc::UnboundedSender<EngineError>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => handle_one(&core, &handler, event, &errors).await,
                None => break,
            },
        }
    }
    while let Some(event) = receiver.try_recv() {
        core.recycler().recycle_event(event);
    }
    core.bus().unsubscribe(receiver.subscription_id());
}

/// Dispatch one owned event with panic containment, then recycle it.
async fn handle_one(
    core: &Arc<SupervisorCore>,
    handler: &Arc<dyn StrategyHandler>,
    event: Box<Event>,
    errors: &mpsc::UnboundedSender<EngineError>,
) {
    let outcome = AssertUnwindSafe(core.dispatch(handler, &event))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(
                instance = %core.id(),
                event_type = %event.event_type,
                error = %err,
                "strategy handler failed"
            );
            let _ = errors.send(err);
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "strategy handler panicked".to_string());
            error!(
                instance = %core.id(),
                event_type = %event.event_type,
                panic = %message,
                "strategy handler panicked"
            );
            let _ = errors.send(EngineError::RuntimeError { message });
        }
    }
    core.recycler().recycle_event(event);
}
