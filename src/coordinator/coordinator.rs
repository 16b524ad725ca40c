//! Strategy coordinator
//!
//! Owns the strategy tasks of one graph. Strategies hand intents to a
//! [`CoordinatorHandle`]; a single drain task clips each intent to the
//! strategy's capital envelope and forwards it through the risk-checked
//! gateway, so envelopes are evaluated one intent at a time.

use futures::FutureExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::graph::{StrategyGraphConfig, StrategyNodeConfig};
use super::policy::{policy_from_config, CapitalPolicy, PositionEnvelope};
use super::strategy::{IntentOutcome, Strategy, StrategyContext, StrategyFactory, StrategyState};
use crate::bus::{BusEvent, EventBus, OrderStatusEvent, Subscription, Topic};
use crate::domain::{OrderIntent, OrderRecord, VenueOrderId};
use crate::error::{BulwarkError, Result};
use crate::lifecycle::{OrderGateway, SubmitOutcome};
use crate::telemetry::Telemetry;
use crate::venue::MarketDataFeed;

pub const DEFAULT_INTENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub intent_queue_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            intent_queue_capacity: DEFAULT_INTENT_QUEUE_CAPACITY,
        }
    }
}

struct IntentRequest {
    strategy_id: String,
    intent: OrderIntent,
    reply: oneshot::Sender<IntentOutcome>,
}

/// Clonable entry point for strategies
#[derive(Clone)]
pub struct CoordinatorHandle {
    intent_tx: mpsc::Sender<IntentRequest>,
    accepting: Arc<AtomicBool>,
}

impl CoordinatorHandle {
    /// Queue an intent on behalf of `strategy_id` and wait for its outcome
    pub async fn submit_order(&self, intent: OrderIntent, strategy_id: &str) -> Result<IntentOutcome> {
        if !self.is_accepting() {
            return Err(BulwarkError::CoordinatorNotRunning);
        }
        let (reply, rx) = oneshot::channel();
        self.intent_tx
            .send(IntentRequest {
                strategy_id: strategy_id.to_string(),
                intent,
                reply,
            })
            .await
            .map_err(|_| BulwarkError::CoordinatorNotRunning)?;
        rx.await.map_err(|_| BulwarkError::CoordinatorNotRunning)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

/// Symbol subscription reference counts across strategies
#[derive(Debug, Default)]
struct SubscriptionCounts {
    counts: BTreeMap<String, usize>,
}

impl SubscriptionCounts {
    /// True when this is the first holder
    fn acquire(&mut self, symbol: &str) -> bool {
        let count = self.counts.entry(symbol.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// True when the last holder let go
    fn release(&mut self, symbol: &str) -> bool {
        match self.counts.get_mut(symbol) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(symbol);
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<(String, usize)> {
        self.counts.iter().map(|(s, c)| (s.clone(), *c)).collect()
    }
}

struct CommittedOrder {
    strategy_id: String,
    record: OrderRecord,
}

/// Per-strategy commitments. Working orders are tracked individually; once
/// an order is terminal its filled quantity folds into a running total and
/// the record is dropped.
#[derive(Default)]
struct CommitmentBook {
    open: HashMap<VenueOrderId, CommittedOrder>,
    settled: HashMap<(String, String), i64>,
}

impl CommitmentBook {
    fn track(&mut self, strategy_id: &str, order_id: VenueOrderId, record: OrderRecord) {
        self.open.insert(
            order_id,
            CommittedOrder {
                strategy_id: strategy_id.to_string(),
                record,
            },
        );
    }

    fn on_status(&mut self, event: &OrderStatusEvent) {
        let Some(order) = self.open.get_mut(&event.order_id) else {
            return;
        };
        order
            .record
            .apply_status(event.status, event.filled_qty, event.avg_price, event.timestamp);
        if !order.record.is_terminal() {
            return;
        }
        if let Some(order) = self.open.remove(&event.order_id) {
            let filled = order.record.intent.side.sign() * order.record.filled_qty as i64;
            let key = (order.strategy_id, order.record.symbol().to_string());
            *self.settled.entry(key).or_insert(0) += filled;
        }
    }

    /// Signed quantity the strategy has working or filled on the symbol
    fn committed(&self, strategy_id: &str, symbol: &str) -> i64 {
        let working: i64 = self
            .open
            .values()
            .filter(|o| o.strategy_id == strategy_id && o.record.symbol() == symbol)
            .map(|o| o.record.intent.side.sign() * o.record.intent.quantity as i64)
            .sum();
        let settled = self
            .settled
            .get(&(strategy_id.to_string(), symbol.to_string()))
            .copied()
            .unwrap_or(0);
        working + settled
    }

    fn keys(&self) -> BTreeSet<(String, String)> {
        let mut keys: BTreeSet<(String, String)> = self.settled.keys().cloned().collect();
        for order in self.open.values() {
            keys.insert((order.strategy_id.clone(), order.record.symbol().to_string()));
        }
        keys
    }

    fn open_orders(&self) -> usize {
        self.open.len()
    }
}

/// Serializes intents: envelope clip, risk pipeline, venue
struct IntentDrain {
    gateway: OrderGateway,
    policy: Box<dyn CapitalPolicy>,
    intents: mpsc::Receiver<IntentRequest>,
    statuses: Subscription,
    orders: CommitmentBook,
    telemetry: Telemetry,
    telemetry_interval: Duration,
}

impl IntentDrain {
    fn committed(&self, strategy_id: &str, symbol: &str) -> i64 {
        self.orders.committed(strategy_id, symbol)
    }

    fn on_status(&mut self, event: &OrderStatusEvent) {
        self.orders.on_status(event);
    }

    fn clip_event(&self, strategy_id: &str, intent: &OrderIntent, reason: &str, requested: u64, allowed: u64) {
        warn!(
            strategy_id,
            symbol = %intent.symbol,
            side = %intent.side,
            requested,
            allowed,
            reason,
            "intent clipped to envelope"
        );
        self.telemetry.warning(
            "coordinator.order_clipped",
            serde_json::json!({
                "strategy_id": strategy_id,
                "symbol": intent.symbol,
                "side": intent.side.to_string(),
                "requested": requested,
                "allowed": allowed,
                "reason": reason,
            }),
        );
    }

    /// Quantity allowed by the envelope, or the outcome when nothing is
    fn clip(
        &self,
        strategy_id: &str,
        intent: &OrderIntent,
        envelope: PositionEnvelope,
        committed: i64,
        price: Option<Decimal>,
    ) -> std::result::Result<u64, IntentOutcome> {
        let requested = intent.quantity;
        let sign = intent.side.sign();
        let mut quantity = requested;

        if let Some(max_position) = envelope.max_position {
            let allowed = (max_position as i64 - sign * committed).max(0) as u64;
            if quantity > allowed {
                self.clip_event(strategy_id, intent, "max_position", quantity, allowed);
                quantity = allowed;
            }
        }

        if let (Some(max_notional), Some(price)) = (envelope.max_notional, price) {
            if price > Decimal::ZERO {
                let cap = (max_notional / price).floor().to_i64().unwrap_or(0);
                if cap <= 0 {
                    self.clip_event(strategy_id, intent, "notional_zero", quantity, 0);
                    return Err(IntentOutcome::rejected(
                        "notional_zero",
                        format!("notional envelope {} buys no shares at {}", max_notional, price),
                    ));
                }
                let allowed = (cap - sign * committed).max(0) as u64;
                if quantity > allowed {
                    self.clip_event(strategy_id, intent, "max_notional", quantity, allowed);
                    quantity = allowed;
                }
            }
        }

        if quantity == 0 {
            self.clip_event(strategy_id, intent, "non_positive_quantity", requested, 0);
            return Err(IntentOutcome::Skipped {
                reason: "envelope exhausted".to_string(),
            });
        }
        Ok(quantity)
    }

    async fn process(&mut self, strategy_id: &str, intent: OrderIntent) -> IntentOutcome {
        if let Err(e) = intent.validate() {
            return IntentOutcome::rejected("invalid_intent", e.to_string());
        }
        let Some(envelope) = self.policy.envelope_for(strategy_id, &intent.symbol) else {
            return IntentOutcome::rejected(
                "symbol_not_allocated",
                format!("strategy {} has no allocation for {}", strategy_id, intent.symbol),
            );
        };

        let committed = self.committed(strategy_id, &intent.symbol);
        let price = intent
            .reference_price()
            .or_else(|| self.gateway.portfolio().snapshot().mark(&intent.symbol));
        let quantity = match self.clip(strategy_id, &intent, envelope, committed, price) {
            Ok(quantity) => quantity,
            Err(outcome) => return outcome,
        };
        let sized = if quantity == intent.quantity {
            intent
        } else {
            intent.with_quantity(quantity)
        };

        match self.gateway.submit_checked(&sized).await {
            SubmitOutcome::Placed { order_id, intent } => {
                let quantity = intent.quantity;
                let symbol = intent.symbol.clone();
                let mut record = OrderRecord::new(intent);
                record.mark_submitted(order_id.clone());
                self.orders.track(strategy_id, order_id.clone(), record);
                let exposure = self.committed(strategy_id, &symbol);
                self.telemetry.info(
                    "coordinator.order_allocation",
                    serde_json::json!({
                        "strategy_id": strategy_id,
                        "symbol": symbol,
                        "order_id": order_id.to_string(),
                        "quantity": quantity,
                        "price": price.map(|p| p.to_string()),
                        "notional": price.map(|p| (p * Decimal::from(quantity)).to_string()),
                    }),
                );
                self.telemetry.info(
                    "coordinator.exposure_snapshot",
                    serde_json::json!({
                        "strategy_id": strategy_id,
                        "symbol": symbol,
                        "committed": exposure,
                    }),
                );
                IntentOutcome::Submitted { order_id, quantity }
            }
            SubmitOutcome::Rejected(reason) => IntentOutcome::rejected(reason.code(), reason.to_string()),
            SubmitOutcome::Failed(e) => {
                let code = if e.needs_reconciliation() {
                    "venue_timeout"
                } else {
                    "venue_error"
                };
                IntentOutcome::rejected(code, e.to_string())
            }
        }
    }

    fn report_exposure(&self) {
        for (strategy_id, symbol) in self.orders.keys() {
            let committed = self.committed(&strategy_id, &symbol);
            if committed == 0 {
                continue;
            }
            self.telemetry.info(
                "coordinator.exposure_snapshot",
                serde_json::json!({
                    "strategy_id": strategy_id,
                    "symbol": symbol,
                    "committed": committed,
                    "periodic": true,
                }),
            );
        }
    }

    async fn handle(&mut self, request: IntentRequest) {
        let IntentRequest {
            strategy_id,
            intent,
            reply,
        } = request;
        let symbol = intent.symbol.clone();
        let side = intent.side;
        let requested = intent.quantity;

        let outcome = self.process(&strategy_id, intent).await;
        debug!(
            strategy_id = %strategy_id,
            %symbol,
            %side,
            requested,
            outcome = outcome.label(),
            "intent decided"
        );
        self.telemetry.info(
            "coordinator.intent_decision",
            serde_json::json!({
                "strategy_id": strategy_id,
                "symbol": symbol,
                "side": side.to_string(),
                "requested": requested,
                "decision": outcome,
            }),
        );
        let _ = reply.send(outcome);
    }

    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut exposure_tick =
            tokio::time::interval_at(Instant::now() + self.telemetry_interval, self.telemetry_interval);
        exposure_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                Some(event) = self.statuses.recv() => {
                    if let BusEvent::OrderStatus(status) = event {
                        self.on_status(&status);
                    }
                }

                Some(request) = self.intents.recv() => self.handle(request).await,

                _ = exposure_tick.tick() => self.report_exposure(),

                else => break,
            }
        }

        self.intents.close();
        while let Ok(request) = self.intents.try_recv() {
            let _ = request.reply.send(IntentOutcome::rejected(
                "coordinator_stopped",
                "coordinator stopped before the intent was processed",
            ));
        }
        debug!(open_orders = self.orders.open_orders(), "intent drain stopped");
    }
}

fn set_state(states: &DashMap<String, StrategyState>, strategy_id: &str, state: StrategyState) {
    states.insert(strategy_id.to_string(), state);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "strategy panicked".to_string()
    }
}

async fn drive_strategy(
    strategy: &mut dyn Strategy,
    ctx: &StrategyContext,
    market: &mut Subscription,
    stop_rx: &mut watch::Receiver<bool>,
    states: &DashMap<String, StrategyState>,
) -> Result<()> {
    let id = ctx.strategy_id();
    set_state(states, id, StrategyState::Started);
    strategy.on_start(ctx).await?;
    set_state(states, id, StrategyState::Running);

    loop {
        tokio::select! {
            biased;

            _ = stop_rx.changed() => break,

            event = market.recv() => match event {
                Some(BusEvent::MarketData(tick)) if ctx.trades(&tick.symbol) => {
                    match strategy.on_market_data(&tick, ctx).await {
                        Ok(()) => {}
                        Err(BulwarkError::CoordinatorNotRunning) => break,
                        Err(e) => return Err(e),
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    set_state(states, id, StrategyState::Stopping);
    strategy.on_stop(ctx).await
}

/// Runs one strategy; a failure or panic only takes this strategy down
async fn run_strategy(
    mut strategy: Box<dyn Strategy>,
    ctx: StrategyContext,
    mut market: Subscription,
    mut stop_rx: watch::Receiver<bool>,
    states: Arc<DashMap<String, StrategyState>>,
    telemetry: Telemetry,
) {
    let result = AssertUnwindSafe(drive_strategy(
        strategy.as_mut(),
        &ctx,
        &mut market,
        &mut stop_rx,
        &states,
    ))
    .catch_unwind()
    .await;

    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(payload) => Some(panic_message(payload.as_ref())),
    };

    let id = ctx.strategy_id();
    match failure {
        None => {
            set_state(&states, id, StrategyState::Stopped);
            info!(strategy_id = id, "strategy stopped");
        }
        Some(reason) => {
            let previous = states.get(id).map(|s| *s.value());
            set_state(&states, id, StrategyState::Failed);
            error!(strategy_id = id, error = %reason, "strategy failed; other strategies continue");
            telemetry.error(
                "coordinator.strategy_failed",
                serde_json::json!({
                    "strategy_id": id,
                    "error": reason,
                    "state": previous.map(|s| s.to_string()),
                }),
            );
        }
    }
}

struct RunningGraph {
    graph: StrategyGraphConfig,
    handle: CoordinatorHandle,
    stop_tx: watch::Sender<bool>,
    strategy_tasks: Vec<(String, JoinHandle<()>)>,
    drain_shutdown: broadcast::Sender<()>,
    drain_task: JoinHandle<()>,
    held_symbols: Vec<String>,
}

pub struct StrategyCoordinator {
    bus: EventBus,
    gateway: OrderGateway,
    feed: Arc<dyn MarketDataFeed>,
    factory: StrategyFactory,
    settings: CoordinatorSettings,
    telemetry: Telemetry,
    policy_override: Option<Box<dyn CapitalPolicy>>,
    states: Arc<DashMap<String, StrategyState>>,
    subscriptions: SubscriptionCounts,
    running: Option<RunningGraph>,
}

impl StrategyCoordinator {
    pub fn new(
        bus: EventBus,
        gateway: OrderGateway,
        feed: Arc<dyn MarketDataFeed>,
        factory: StrategyFactory,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            bus,
            gateway,
            feed,
            factory,
            settings: CoordinatorSettings::default(),
            telemetry,
            policy_override: None,
            states: Arc::new(DashMap::new()),
            subscriptions: SubscriptionCounts::default(),
            running: None,
        }
    }

    pub fn with_settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use this policy instead of the one named in the graph
    pub fn with_policy(mut self, policy: Box<dyn CapitalPolicy>) -> Self {
        self.policy_override = Some(policy);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn handle(&self) -> Option<CoordinatorHandle> {
        self.running.as_ref().map(|r| r.handle.clone())
    }

    pub async fn submit_order(&self, intent: OrderIntent, strategy_id: &str) -> Result<IntentOutcome> {
        match &self.running {
            Some(running) => running.handle.submit_order(intent, strategy_id).await,
            None => Err(BulwarkError::CoordinatorNotRunning),
        }
    }

    pub fn strategy_states(&self) -> BTreeMap<String, StrategyState> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn strategy_state(&self, strategy_id: &str) -> Option<StrategyState> {
        self.states.get(strategy_id).map(|s| *s.value())
    }

    /// `(symbol, holders)` for every symbol currently subscribed
    pub fn subscriptions(&self) -> Vec<(String, usize)> {
        self.subscriptions.snapshot()
    }

    pub fn graph(&self) -> Option<&StrategyGraphConfig> {
        self.running.as_ref().map(|r| &r.graph)
    }

    fn instantiate(
        &self,
        graph: &StrategyGraphConfig,
    ) -> Result<Vec<(StrategyNodeConfig, Box<dyn Strategy>)>> {
        let mut built = Vec::with_capacity(graph.strategies.len());
        for node in &graph.strategies {
            set_state(&self.states, &node.id, StrategyState::Registered);
            match self.factory.build(node) {
                Ok(strategy) => built.push((node.clone(), strategy)),
                Err(e) if graph.settings.allow_partial_start => {
                    set_state(&self.states, &node.id, StrategyState::Failed);
                    error!(strategy_id = %node.id, error = %e, "strategy could not be built; starting without it");
                    self.telemetry.error(
                        "coordinator.strategy_failed",
                        serde_json::json!({
                            "strategy_id": node.id,
                            "error": e.to_string(),
                            "state": StrategyState::Registered.to_string(),
                        }),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        if built.is_empty() {
            return Err(BulwarkError::StrategyInitialization(
                "no strategy in the graph could be built".to_string(),
            ));
        }
        Ok(built)
    }

    /// Subscribe each symbol once, in sorted order; rolls back on failure
    async fn acquire_symbols(&mut self, symbols: &[String]) -> Result<()> {
        let mut first: BTreeSet<String> = BTreeSet::new();
        for symbol in symbols {
            if self.subscriptions.acquire(symbol) {
                first.insert(symbol.clone());
            }
        }

        let mut subscribed: Vec<String> = Vec::new();
        for symbol in &first {
            if let Err(e) = self.feed.subscribe(symbol).await {
                error!(%symbol, error = %e, "market data subscription failed");
                for done in &subscribed {
                    let _ = self.feed.unsubscribe(done).await;
                }
                for symbol in symbols {
                    self.subscriptions.release(symbol);
                }
                return Err(e);
            }
            subscribed.push(symbol.clone());
        }
        Ok(())
    }

    async fn release_symbols(&mut self, symbols: &[String]) {
        let mut last: BTreeSet<String> = BTreeSet::new();
        for symbol in symbols {
            if self.subscriptions.release(symbol) {
                last.insert(symbol.clone());
            }
        }
        for symbol in &last {
            if let Err(e) = self.feed.unsubscribe(symbol).await {
                warn!(%symbol, error = %e, "market data unsubscribe failed");
            }
        }
    }

    /// Validate the graph, build its strategies and start them
    pub async fn start(&mut self, graph: StrategyGraphConfig) -> Result<CoordinatorHandle> {
        if self.running.is_some() {
            return Err(BulwarkError::Validation("coordinator is already running".to_string()));
        }
        let graph = graph.normalized();
        graph
            .validate()
            .map_err(|errors| BulwarkError::Validation(errors.join("; ")))?;

        let mut policy = match self.policy_override.take() {
            Some(policy) => policy,
            None => policy_from_config(&graph.capital_policy)?,
        };
        policy.prepare(&graph)?;
        let policy_name = policy.name().to_string();

        self.states.clear();
        let built = self.instantiate(&graph)?;

        let held_symbols: Vec<String> = built
            .iter()
            .flat_map(|(node, _)| node.symbols.iter().cloned())
            .collect();
        self.acquire_symbols(&held_symbols).await?;

        let (intent_tx, intent_rx) = mpsc::channel(self.settings.intent_queue_capacity.max(1));
        let handle = CoordinatorHandle {
            intent_tx,
            accepting: Arc::new(AtomicBool::new(true)),
        };

        let drain = IntentDrain {
            gateway: self.gateway.clone(),
            policy,
            intents: intent_rx,
            statuses: self.bus.subscribe(Topic::OrderStatus),
            orders: CommitmentBook::default(),
            telemetry: self.telemetry.clone(),
            telemetry_interval: Duration::from_secs(graph.settings.telemetry_interval_secs.max(1)),
        };
        let (drain_shutdown, drain_rx) = broadcast::channel(1);
        let drain_task = tokio::spawn(drain.run(drain_rx));

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut strategy_tasks = Vec::with_capacity(built.len());
        for (node, strategy) in built {
            let ctx = StrategyContext::new(
                node.id.clone(),
                node.symbols.iter().cloned().collect(),
                handle.clone(),
                self.gateway.portfolio().clone(),
            );
            let task = tokio::spawn(run_strategy(
                strategy,
                ctx,
                self.bus.subscribe(Topic::MarketData),
                stop_rx.clone(),
                self.states.clone(),
                self.telemetry.clone(),
            ));
            strategy_tasks.push((node.id.clone(), task));
        }

        info!(
            graph = %graph.name,
            strategies = strategy_tasks.len(),
            symbols = ?self.subscriptions.snapshot(),
            policy = %policy_name,
            "strategy coordinator started"
        );

        self.running = Some(RunningGraph {
            graph,
            handle: handle.clone(),
            stop_tx,
            strategy_tasks,
            drain_shutdown,
            drain_task,
            held_symbols,
        });
        Ok(handle)
    }

    /// Stop intake, stop strategies, then release market data
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.handle.accepting.store(false, Ordering::SeqCst);
        let _ = running.stop_tx.send(true);

        let wait = Duration::from_secs(running.graph.settings.heartbeat_timeout_secs);
        for (strategy_id, mut task) in running.strategy_tasks {
            if tokio::time::timeout(wait, &mut task).await.is_err() {
                warn!(strategy_id = %strategy_id, "strategy did not stop in time; aborting it");
                task.abort();
                set_state(&self.states, &strategy_id, StrategyState::Stopped);
            }
        }

        let _ = running.drain_shutdown.send(());
        let drain_wait = self.gateway.timeout() * 2;
        if tokio::time::timeout(drain_wait, running.drain_task).await.is_err() {
            warn!("intent drain did not stop in time");
        }

        self.release_symbols(&running.held_symbols).await;
        info!(graph = %running.graph.name, "strategy coordinator stopped");
        Ok(())
    }
}
