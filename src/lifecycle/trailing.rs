//! Trailing stops
//!
//! A STOP order whose price follows the market in the protected position's
//! favor and never back. The water mark only moves favorably; the venue
//! order is modified when the derived stop is strictly better than the
//! current one and the per-symbol rate-limit clock (tick timestamps) allows
//! it. A new stop price is committed only after the venue accepts it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::gateway::OrderGateway;
use super::{emit_transition, LegAction, LegBook, LegKey};
use crate::bus::{AccountEvent, BusEvent, EventBus, OrderStatusEvent, Subscription, Topic};
use crate::domain::{LegRole, ModifyTerms, OrderIntent, OrderSide, OrderStatus, VenueOrderId};
use crate::error::{BulwarkError, Result};
use crate::persistence::{CheckpointService, Checkpointable};
use crate::portfolio::PortfolioSnapshot;
use crate::telemetry::Telemetry;

pub const DEFAULT_MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Distance between the water mark and the stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Trail {
    Amount(Decimal),
    /// Percentage of the water mark, strictly between 0 and 100
    Percent(Decimal),
}

impl Trail {
    pub fn validate(&self) -> Result<()> {
        match self {
            Trail::Amount(amount) if *amount <= Decimal::ZERO => Err(BulwarkError::Validation(
                format!("trail amount must be positive, got {}", amount),
            )),
            Trail::Percent(pct) if *pct <= Decimal::ZERO || *pct >= Decimal::ONE_HUNDRED => {
                Err(BulwarkError::Validation(format!(
                    "trail percent must be in (0, 100), got {}",
                    pct
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn offset(&self, mark: Decimal) -> Decimal {
        match self {
            Trail::Amount(amount) => *amount,
            Trail::Percent(pct) => mark * *pct / Decimal::ONE_HUNDRED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingState {
    /// Working, waiting for the activation price
    Pending,
    Active,
    Triggered,
    Cancelled,
}

impl TrailingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrailingState::Triggered | TrailingState::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingStopSpec {
    pub symbol: String,
    /// SELL protects a long, BUY protects a short
    pub side: OrderSide,
    pub quantity: u64,
    pub trail: Trail,
    pub activation_price: Option<Decimal>,
    /// Price the initial stop is derived from; the last tick or portfolio
    /// mark is used when absent
    pub reference_price: Option<Decimal>,
}

impl TrailingStopSpec {
    pub fn new(symbol: &str, side: OrderSide, quantity: u64, trail: Trail) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            side,
            quantity,
            trail,
            activation_price: None,
            reference_price: None,
        }
    }

    pub fn with_activation_price(mut self, price: Decimal) -> Self {
        self.activation_price = Some(price);
        self
    }

    pub fn with_reference_price(mut self, price: Decimal) -> Self {
        self.reference_price = Some(price);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(BulwarkError::Validation("trailing stop symbol is empty".to_string()));
        }
        if self.quantity == 0 {
            return Err(BulwarkError::Validation(
                "trailing stop quantity must be positive".to_string(),
            ));
        }
        if let Some(price) = self.activation_price {
            if price <= Decimal::ZERO {
                return Err(BulwarkError::Validation(format!(
                    "activation price must be positive, got {}",
                    price
                )));
            }
        }
        self.trail.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    pub stop_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub trail: Trail,
    pub activation_price: Option<Decimal>,
    pub stop_price: Decimal,
    /// Best price seen since activation: high for a long, low for a short
    pub water_mark: Decimal,
    pub activated: bool,
    pub last_adjusted: Option<DateTime<Utc>>,
    pub state: TrailingState,
    pub order_id: VenueOrderId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub position_seen: bool,
    #[serde(skip)]
    pub pending_stop: Option<Decimal>,
    #[serde(skip)]
    pub cancel_requested: bool,
}

impl TrailingStop {
    fn is_long(&self) -> bool {
        self.side == OrderSide::Sell
    }

    /// Fold a tick into the water mark; true when it moved
    fn observe(&mut self, price: Decimal) -> bool {
        let better = if self.is_long() {
            price > self.water_mark
        } else {
            price < self.water_mark
        };
        if better {
            self.water_mark = price;
        }
        better
    }

    fn crosses_activation(&self, price: Decimal) -> bool {
        match self.activation_price {
            None => true,
            Some(level) if self.is_long() => price >= level,
            Some(level) => price <= level,
        }
    }

    pub fn candidate_stop(&self) -> Decimal {
        stop_from(self.side, self.water_mark, &self.trail)
    }

    /// Strictly more protective than the current stop
    pub fn improves(&self, candidate: Decimal) -> bool {
        if self.is_long() {
            candidate > self.stop_price
        } else {
            candidate < self.stop_price
        }
    }

    /// Protected position size in `snapshot`, zero when the position is
    /// flat or on the wrong side
    fn protected_quantity(&self, snapshot: &PortfolioSnapshot) -> i64 {
        let qty = snapshot.quantity(&self.symbol);
        match self.side {
            OrderSide::Sell if qty > 0 => qty,
            OrderSide::Buy if qty < 0 => -qty,
            _ => 0,
        }
    }
}

fn stop_from(side: OrderSide, mark: Decimal, trail: &Trail) -> Decimal {
    match side {
        OrderSide::Sell => mark - trail.offset(mark),
        OrderSide::Buy => mark + trail.offset(mark),
    }
}

fn set_state(telemetry: &Telemetry, stop: &mut TrailingStop, to: TrailingState) {
    if stop.state == to {
        return;
    }
    emit_transition(telemetry, "trailing", &stop.stop_id, &stop.symbol, stop.state, to);
    stop.state = to;
}

#[derive(Debug, Clone)]
struct PendingCreation {
    spec: TrailingStopSpec,
    reference: Decimal,
}

#[derive(Serialize, Deserialize)]
struct BookCheckpoint {
    stops: Vec<TrailingStop>,
}

pub struct TrailingStopBook {
    stops: BTreeMap<String, TrailingStop>,
    index: HashMap<VenueOrderId, String>,
    pending: HashMap<String, PendingCreation>,
    outcomes: HashMap<String, std::result::Result<String, String>>,
    /// Rate-limit clock: tick time of the last modification per symbol
    last_modify: HashMap<String, DateTime<Utc>>,
    min_interval: chrono::Duration,
    version: i64,
    telemetry: Telemetry,
}

impl TrailingStopBook {
    pub fn new(min_update_interval: Duration, telemetry: Telemetry) -> Self {
        let min_interval =
            chrono::Duration::from_std(min_update_interval).unwrap_or_else(|_| chrono::Duration::seconds(1));
        Self {
            stops: BTreeMap::new(),
            index: HashMap::new(),
            pending: HashMap::new(),
            outcomes: HashMap::new(),
            last_modify: HashMap::new(),
            min_interval,
            version: 0,
            telemetry,
        }
    }

    pub fn get(&self, stop_id: &str) -> Option<&TrailingStop> {
        self.stops.get(stop_id)
    }

    pub fn stops(&self) -> impl Iterator<Item = &TrailingStop> {
        self.stops.values()
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Request a new stop. Returns the provisional key used until the
    /// venue assigns an order id, plus the STOP submission.
    pub fn create(&mut self, spec: TrailingStopSpec, reference: Decimal) -> Result<(String, Vec<LegAction>)> {
        spec.validate()?;
        if reference <= Decimal::ZERO {
            return Err(BulwarkError::Validation(format!(
                "reference price must be positive, got {}",
                reference
            )));
        }
        let stop_price = stop_from(spec.side, reference, &spec.trail);
        if stop_price <= Decimal::ZERO {
            return Err(BulwarkError::Validation(format!(
                "trail {:?} leaves no room below {}",
                spec.trail, reference
            )));
        }

        let intent = OrderIntent::stop(&spec.symbol, spec.side, spec.quantity, stop_price);
        let provisional = intent.intent_id.to_string();
        let intent = intent.with_group(provisional.clone(), LegRole::TrailingStop);
        info!(
            symbol = %spec.symbol,
            side = %spec.side,
            qty = spec.quantity,
            %reference,
            %stop_price,
            "creating trailing stop"
        );
        self.pending
            .insert(provisional.clone(), PendingCreation { spec, reference });
        Ok((
            provisional.clone(),
            vec![LegAction::Submit {
                key: LegKey::new(provisional, LegRole::TrailingStop),
                intent,
            }],
        ))
    }

    /// Result of a creation once the venue has answered: the stop id, or
    /// the rejection reason
    pub fn take_outcome(&mut self, provisional: &str) -> Option<std::result::Result<String, String>> {
        self.outcomes.remove(provisional)
    }

    pub fn cancel(&mut self, stop_id: &str) -> Result<Vec<LegAction>> {
        let stop = self
            .stops
            .get_mut(stop_id)
            .ok_or_else(|| BulwarkError::UnknownGroup(stop_id.to_string()))?;
        if stop.state.is_terminal() || stop.cancel_requested {
            return Ok(Vec::new());
        }
        stop.cancel_requested = true;
        Ok(vec![LegAction::Cancel {
            key: LegKey::new(stop_id, LegRole::TrailingStop),
            order_id: stop.order_id.clone(),
        }])
    }

    pub fn on_tick(&mut self, symbol: &str, price: Decimal, at: DateTime<Utc>) -> Vec<LegAction> {
        let mut clock_open = match self.last_modify.get(symbol) {
            Some(last) => at - *last >= self.min_interval,
            None => true,
        };
        let mut actions = Vec::new();

        for stop in self.stops.values_mut() {
            if stop.symbol != symbol || stop.state.is_terminal() || stop.cancel_requested {
                continue;
            }
            if !stop.activated {
                if !stop.crosses_activation(price) {
                    continue;
                }
                stop.activated = true;
                stop.water_mark = price;
                info!(stop_id = %stop.stop_id, %price, "trailing stop activated");
                set_state(&self.telemetry, stop, TrailingState::Active);
            } else {
                stop.observe(price);
            }

            if stop.pending_stop.is_some() {
                continue;
            }
            let candidate = stop.candidate_stop();
            if !stop.improves(candidate) {
                continue;
            }
            if !clock_open {
                debug!(stop_id = %stop.stop_id, %candidate, "adjustment deferred by rate limit");
                continue;
            }

            stop.pending_stop = Some(candidate);
            clock_open = false;
            self.last_modify.insert(symbol.to_string(), at);
            actions.push(LegAction::Modify {
                key: LegKey::new(stop.stop_id.clone(), LegRole::TrailingStop),
                order_id: stop.order_id.clone(),
                terms: ModifyTerms::price(candidate),
            });
        }
        actions
    }

    pub fn on_status(&mut self, event: &OrderStatusEvent) -> Vec<LegAction> {
        let Some(stop_id) = self.index.get(&event.order_id) else {
            return Vec::new();
        };
        let Some(stop) = self.stops.get_mut(stop_id) else {
            return Vec::new();
        };
        if stop.state.is_terminal() {
            return Vec::new();
        }
        let to = match event.status {
            OrderStatus::Filled => TrailingState::Triggered,
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired => {
                TrailingState::Cancelled
            }
            _ => return Vec::new(),
        };
        if to == TrailingState::Triggered {
            info!(stop_id = %stop.stop_id, stop_price = %stop.stop_price, "trailing stop triggered");
        }
        stop.pending_stop = None;
        set_state(&self.telemetry, stop, to);
        self.version += 1;
        Vec::new()
    }

    /// Cancel stops whose protected position has gone flat
    pub fn on_account(&mut self, snapshot: &PortfolioSnapshot) -> Vec<LegAction> {
        let mut actions = Vec::new();
        for stop in self.stops.values_mut() {
            if stop.state.is_terminal() || stop.cancel_requested {
                continue;
            }
            if stop.protected_quantity(snapshot) > 0 {
                if !stop.position_seen {
                    stop.position_seen = true;
                    self.version += 1;
                }
                continue;
            }
            if stop.position_seen && snapshot.quantity(&stop.symbol) == 0 {
                info!(stop_id = %stop.stop_id, symbol = %stop.symbol, "position closed; cancelling trailing stop");
                stop.cancel_requested = true;
                actions.push(LegAction::Cancel {
                    key: LegKey::new(stop.stop_id.clone(), LegRole::TrailingStop),
                    order_id: stop.order_id.clone(),
                });
            }
        }
        actions
    }
}

impl LegBook for TrailingStopBook {
    fn on_submitted(&mut self, key: &LegKey, order_id: VenueOrderId, sent: OrderIntent) -> Vec<LegAction> {
        let Some(PendingCreation { spec, reference }) = self.pending.remove(&key.group_id) else {
            warn!(leg = %key, %order_id, "submission for unknown trailing stop");
            return Vec::new();
        };
        let stop_id = format!("{}_{}", spec.symbol, order_id);
        let activated = spec.activation_price.is_none();
        let stop = TrailingStop {
            stop_id: stop_id.clone(),
            symbol: spec.symbol,
            side: spec.side,
            quantity: sent.quantity,
            trail: spec.trail,
            activation_price: spec.activation_price,
            stop_price: sent.stop_price.unwrap_or_else(|| stop_from(spec.side, reference, &spec.trail)),
            water_mark: reference,
            activated,
            last_adjusted: None,
            state: if activated {
                TrailingState::Active
            } else {
                TrailingState::Pending
            },
            order_id: order_id.clone(),
            created_at: Utc::now(),
            position_seen: false,
            pending_stop: None,
            cancel_requested: false,
        };
        info!(%stop_id, stop_price = %stop.stop_price, state = ?stop.state, "trailing stop placed");
        self.telemetry.info(
            "trailing.created",
            serde_json::json!({
                "stop_id": stop_id,
                "symbol": stop.symbol,
                "side": stop.side.to_string(),
                "quantity": stop.quantity,
                "stop_price": stop.stop_price.to_string(),
                "activated": stop.activated,
            }),
        );
        self.index.insert(order_id, stop_id.clone());
        self.stops.insert(stop_id.clone(), stop);
        self.outcomes.insert(key.group_id.clone(), Ok(stop_id));
        self.version += 1;
        Vec::new()
    }

    fn on_submit_failed(&mut self, key: &LegKey, reason: String) -> Vec<LegAction> {
        if self.pending.remove(&key.group_id).is_some() {
            warn!(leg = %key, %reason, "trailing stop was not placed");
            self.outcomes.insert(key.group_id.clone(), Err(reason));
        }
        Vec::new()
    }

    fn on_cancel_result(
        &mut self,
        key: &LegKey,
        order_id: &VenueOrderId,
        result: &Result<()>,
    ) -> Vec<LegAction> {
        if let Err(e) = result {
            warn!(stop_id = %key.group_id, %order_id, error = %e, "trailing stop cancel failed");
            if let Some(stop) = self.stops.get_mut(&key.group_id) {
                stop.cancel_requested = false;
            }
        }
        Vec::new()
    }

    fn on_modify_result(
        &mut self,
        key: &LegKey,
        order_id: &VenueOrderId,
        terms: ModifyTerms,
        result: &Result<()>,
    ) -> Vec<LegAction> {
        let Some(stop) = self.stops.get_mut(&key.group_id) else {
            return Vec::new();
        };
        let Some(requested) = stop.pending_stop.take() else {
            return Vec::new();
        };
        match result {
            Ok(()) => {
                let new_price = terms.price.unwrap_or(requested);
                if !stop.improves(new_price) {
                    return Vec::new();
                }
                let previous = stop.stop_price;
                stop.stop_price = new_price;
                stop.last_adjusted = self.last_modify.get(&stop.symbol).copied();
                self.version += 1;
                info!(
                    stop_id = %stop.stop_id,
                    from = %previous,
                    to = %new_price,
                    water_mark = %stop.water_mark,
                    "trailing stop raised"
                );
                self.telemetry.info(
                    "trailing.adjusted",
                    serde_json::json!({
                        "stop_id": stop.stop_id,
                        "symbol": stop.symbol,
                        "from": previous.to_string(),
                        "to": new_price.to_string(),
                        "water_mark": stop.water_mark.to_string(),
                    }),
                );
            }
            Err(e) => {
                if e.needs_reconciliation() {
                    error!(stop_id = %stop.stop_id, %order_id, "stop modification outcome unknown");
                } else {
                    warn!(stop_id = %stop.stop_id, %order_id, error = %e, "stop modification refused");
                }
            }
        }
        Vec::new()
    }
}

impl Checkpointable for TrailingStopBook {
    fn checkpoint_type(&self) -> &str {
        "lifecycle"
    }

    fn component_name(&self) -> &str {
        "trailing_stops"
    }

    fn to_checkpoint(&self) -> Result<serde_json::Value> {
        let body = BookCheckpoint {
            stops: self.stops.values().cloned().collect(),
        };
        Ok(serde_json::to_value(body)?)
    }

    fn from_checkpoint(&mut self, data: &serde_json::Value) -> Result<()> {
        let body: BookCheckpoint = serde_json::from_value(data.clone())?;
        self.stops.clear();
        self.index.clear();
        for stop in body.stops {
            self.index.insert(stop.order_id.clone(), stop.stop_id.clone());
            self.stops.insert(stop.stop_id.clone(), stop);
        }
        Ok(())
    }

    fn version(&self) -> i64 {
        self.version
    }
}

enum TrailingCommand {
    Create {
        spec: TrailingStopSpec,
        reply: oneshot::Sender<Result<TrailingStop>>,
    },
    Cancel {
        stop_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        stop_id: String,
        reply: oneshot::Sender<Option<TrailingStop>>,
    },
    List {
        reply: oneshot::Sender<Vec<TrailingStop>>,
    },
}

#[derive(Clone)]
pub struct TrailingStopHandle {
    tx: mpsc::Sender<TrailingCommand>,
}

impl TrailingStopHandle {
    pub async fn create(&self, spec: TrailingStopSpec) -> Result<TrailingStop> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(TrailingCommand::Create { spec, reply }).await?;
        rx.await?
    }

    pub async fn cancel(&self, stop_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrailingCommand::Cancel {
                stop_id: stop_id.to_string(),
                reply,
            })
            .await?;
        rx.await?
    }

    pub async fn get(&self, stop_id: &str) -> Result<Option<TrailingStop>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrailingCommand::Get {
                stop_id: stop_id.to_string(),
                reply,
            })
            .await?;
        Ok(rx.await?)
    }

    pub async fn list(&self) -> Result<Vec<TrailingStop>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(TrailingCommand::List { reply }).await?;
        Ok(rx.await?)
    }
}

pub struct TrailingStopManager {
    book: TrailingStopBook,
    gateway: OrderGateway,
    statuses: Subscription,
    market_data: Subscription,
    account: Subscription,
    commands: mpsc::Receiver<TrailingCommand>,
    checkpoints: Option<CheckpointService>,
    last_prices: HashMap<String, Decimal>,
    saved_version: i64,
}

impl TrailingStopManager {
    pub fn new(
        bus: &EventBus,
        gateway: OrderGateway,
        min_update_interval: Duration,
        telemetry: Telemetry,
    ) -> (Self, TrailingStopHandle) {
        let (tx, commands) = mpsc::channel(64);
        let manager = Self {
            book: TrailingStopBook::new(min_update_interval, telemetry),
            gateway,
            statuses: bus.subscribe(Topic::OrderStatus),
            market_data: bus.subscribe(Topic::MarketData),
            account: bus.subscribe(Topic::Account),
            commands,
            checkpoints: None,
            last_prices: HashMap::new(),
            saved_version: 0,
        };
        (manager, TrailingStopHandle { tx })
    }

    pub fn with_checkpoints(mut self, checkpoints: CheckpointService) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    fn reference_price(&self, spec: &TrailingStopSpec) -> Option<Decimal> {
        spec.reference_price
            .or_else(|| self.last_prices.get(&spec.symbol).copied())
            .or_else(|| self.gateway.portfolio().snapshot().mark(&spec.symbol))
    }

    async fn handle_command(&mut self, command: TrailingCommand) {
        match command {
            TrailingCommand::Create { spec, reply } => {
                let result = self.create(spec).await;
                let _ = reply.send(result);
            }
            TrailingCommand::Cancel { stop_id, reply } => {
                let result = match self.book.cancel(&stop_id) {
                    Ok(actions) => {
                        self.gateway.drive(&mut self.book, actions).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            TrailingCommand::Get { stop_id, reply } => {
                let _ = reply.send(self.book.get(&stop_id).cloned());
            }
            TrailingCommand::List { reply } => {
                let _ = reply.send(self.book.stops().cloned().collect());
            }
        }
    }

    async fn create(&mut self, spec: TrailingStopSpec) -> Result<TrailingStop> {
        let reference = self.reference_price(&spec).ok_or_else(|| {
            BulwarkError::Validation(format!("no reference price for {}", spec.symbol))
        })?;
        let (provisional, actions) = self.book.create(spec, reference)?;
        self.gateway.drive(&mut self.book, actions).await;
        match self.book.take_outcome(&provisional) {
            Some(Ok(stop_id)) => self
                .book
                .get(&stop_id)
                .cloned()
                .ok_or(BulwarkError::UnknownGroup(stop_id)),
            Some(Err(reason)) => Err(BulwarkError::VenueRejected(reason)),
            None => Err(BulwarkError::Internal(format!(
                "trailing stop {} has no submission outcome",
                provisional
            ))),
        }
    }

    async fn checkpoint_if_changed(&mut self) {
        let Some(checkpoints) = &self.checkpoints else {
            return;
        };
        if self.book.version() == self.saved_version {
            return;
        }
        match checkpoints.create_checkpoint(&self.book).await {
            Ok(()) => self.saved_version = self.book.version(),
            Err(e) => error!(error = %e, "trailing stop checkpoint failed"),
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        if let Some(checkpoints) = &self.checkpoints {
            match checkpoints.restore_checkpoint(&mut self.book).await {
                Ok(true) => info!(stops = self.book.len(), "trailing stops restored"),
                Ok(false) => {}
                Err(e) => error!(error = %e, "trailing stop restore failed; starting empty"),
            }
        }
        self.saved_version = self.book.version();
        info!("trailing stop manager starting");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                Some(command) = self.commands.recv() => self.handle_command(command).await,

                Some(event) = self.statuses.recv() => {
                    if let BusEvent::OrderStatus(status) = event {
                        let actions = self.book.on_status(&status);
                        self.gateway.drive(&mut self.book, actions).await;
                    }
                }

                Some(event) = self.market_data.recv() => {
                    if let BusEvent::MarketData(tick) = event {
                        self.last_prices.insert(tick.symbol.clone(), tick.price);
                        let actions = self.book.on_tick(&tick.symbol, tick.price, tick.timestamp);
                        self.gateway.drive(&mut self.book, actions).await;
                    }
                }

                Some(event) = self.account.recv() => {
                    if let BusEvent::Account(AccountEvent::Snapshot(snapshot)) = event {
                        let actions = self.book.on_account(&snapshot);
                        self.gateway.drive(&mut self.book, actions).await;
                    }
                }

                else => break,
            }
            self.checkpoint_if_changed().await;
        }

        self.checkpoint_if_changed().await;
        info!(stops = self.book.len(), "trailing stop manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap() + chrono::Duration::seconds(seconds)
    }

    fn book() -> TrailingStopBook {
        TrailingStopBook::new(DEFAULT_MIN_UPDATE_INTERVAL, Telemetry::disabled())
    }

    /// Create and place a stop as order "T1"
    fn placed(book: &mut TrailingStopBook, spec: TrailingStopSpec, reference: Decimal) -> String {
        let (provisional, actions) = book.create(spec, reference).unwrap();
        let LegAction::Submit { key, intent } = &actions[0] else {
            panic!("expected submit");
        };
        book.on_submitted(key, VenueOrderId::new("T1"), intent.clone());
        book.take_outcome(&provisional).unwrap().unwrap()
    }

    /// Apply a tick and accept any modification it produces
    fn tick(book: &mut TrailingStopBook, stop_id: &str, price: Decimal, at: DateTime<Utc>) -> bool {
        let actions = book.on_tick("AAPL", price, at);
        let modified = !actions.is_empty();
        for action in actions {
            if let LegAction::Modify { key, order_id, terms } = action {
                assert_eq!(key.group_id, stop_id);
                book.on_modify_result(&key, &order_id, terms, &Ok(()));
            }
        }
        modified
    }

    fn long(trail: Trail) -> TrailingStopSpec {
        TrailingStopSpec::new("AAPL", OrderSide::Sell, 10, trail)
    }

    #[test]
    fn test_trail_validation() {
        assert!(Trail::Amount(dec!(5)).validate().is_ok());
        assert!(Trail::Amount(dec!(0)).validate().is_err());
        assert!(Trail::Percent(dec!(2.5)).validate().is_ok());
        assert!(Trail::Percent(dec!(0)).validate().is_err());
        assert!(Trail::Percent(dec!(100)).validate().is_err());
        assert_eq!(Trail::Percent(dec!(10)).offset(dec!(160)), dec!(16));
    }

    #[test]
    fn test_initial_stop_and_stop_id() {
        let mut book = book();
        let (_, actions) = book.create(long(Trail::Amount(dec!(5))), dec!(150)).unwrap();
        match &actions[0] {
            LegAction::Submit { key, intent } => {
                assert_eq!(key.role, LegRole::TrailingStop);
                assert_eq!(intent.stop_price, Some(dec!(145)));
                assert_eq!(intent.side, OrderSide::Sell);
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut book = self::book();
        let id = placed(&mut book, long(Trail::Amount(dec!(5))), dec!(150));
        assert_eq!(id, "AAPL_T1");
        assert_eq!(book.get(&id).unwrap().state, TrailingState::Active);
    }

    #[test]
    fn test_long_stop_follows_the_high() {
        let mut book = book();
        let id = placed(&mut book, long(Trail::Amount(dec!(5))), dec!(150));
        assert_eq!(book.get(&id).unwrap().stop_price, dec!(145));

        assert!(tick(&mut book, &id, dec!(160), t(0)));
        assert_eq!(book.get(&id).unwrap().stop_price, dec!(155));

        assert!(!tick(&mut book, &id, dec!(156), t(5)));
        let stop = book.get(&id).unwrap();
        assert_eq!(stop.stop_price, dec!(155));
        assert_eq!(stop.water_mark, dec!(160));
    }

    #[test]
    fn test_short_stop_follows_the_low() {
        let mut book = book();
        let spec = TrailingStopSpec::new("AAPL", OrderSide::Buy, 10, Trail::Amount(dec!(5)));
        let id = placed(&mut book, spec, dec!(150));
        assert_eq!(book.get(&id).unwrap().stop_price, dec!(155));

        assert!(tick(&mut book, &id, dec!(140), t(0)));
        assert_eq!(book.get(&id).unwrap().stop_price, dec!(145));
        assert!(!tick(&mut book, &id, dec!(148), t(2)));
        assert_eq!(book.get(&id).unwrap().stop_price, dec!(145));
    }

    #[test]
    fn test_rate_limit_uses_tick_clock() {
        let mut book = book();
        let id = placed(&mut book, long(Trail::Amount(dec!(5))), dec!(150));

        assert!(tick(&mut book, &id, dec!(160), t(0)));
        // half a second later: deferred, but the water mark still moves
        let deferred = book.on_tick("AAPL", dec!(162), t(0) + chrono::Duration::milliseconds(500));
        assert!(deferred.is_empty());
        assert_eq!(book.get(&id).unwrap().water_mark, dec!(162));

        assert!(tick(&mut book, &id, dec!(162), t(1)));
        assert_eq!(book.get(&id).unwrap().stop_price, dec!(157));
    }

    #[test]
    fn test_refused_modification_keeps_stop() {
        let mut book = book();
        let id = placed(&mut book, long(Trail::Amount(dec!(5))), dec!(150));
        let actions = book.on_tick("AAPL", dec!(160), t(0));
        let LegAction::Modify { key, order_id, terms } = &actions[0] else {
            panic!("expected modify");
        };
        book.on_modify_result(
            key,
            order_id,
            *terms,
            &Err(BulwarkError::VenueRejected("too close to market".to_string())),
        );
        let stop = book.get(&id).unwrap();
        assert_eq!(stop.stop_price, dec!(145));
        assert!(stop.pending_stop.is_none());

        // next eligible tick retries
        assert!(tick(&mut book, &id, dec!(160), t(2)));
        assert_eq!(book.get(&id).unwrap().stop_price, dec!(155));
    }

    #[test]
    fn test_activation_price_holds_stop() {
        let mut book = book();
        let spec = long(Trail::Amount(dec!(5))).with_activation_price(dec!(155));
        let id = placed(&mut book, spec, dec!(150));
        assert_eq!(book.get(&id).unwrap().state, TrailingState::Pending);

        assert!(!tick(&mut book, &id, dec!(154), t(0)));
        assert_eq!(book.get(&id).unwrap().state, TrailingState::Pending);

        assert!(tick(&mut book, &id, dec!(156), t(2)));
        let stop = book.get(&id).unwrap();
        assert_eq!(stop.state, TrailingState::Active);
        assert_eq!(stop.stop_price, dec!(151));
    }

    #[test]
    fn test_percent_trail_from_water_mark() {
        let mut book = book();
        let id = placed(&mut book, long(Trail::Percent(dec!(10))), dec!(100));
        assert_eq!(book.get(&id).unwrap().stop_price, dec!(90));
        assert!(tick(&mut book, &id, dec!(120), t(0)));
        assert_eq!(book.get(&id).unwrap().stop_price, dec!(108));
    }

    #[test]
    fn test_long_stop_never_decreases() {
        let mut book = book();
        let id = placed(&mut book, long(Trail::Amount(dec!(3))), dec!(100));
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut last = book.get(&id).unwrap().stop_price;
        for i in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let step = Decimal::from((seed >> 33) % 1000) / dec!(100) - dec!(5);
            let price = (dec!(100) + step * Decimal::from(i % 7)).max(dec!(1));
            tick(&mut book, &id, price, t(i));
            let current = book.get(&id).unwrap().stop_price;
            assert!(current >= last, "stop moved down from {} to {}", last, current);
            last = current;
        }
    }

    #[test]
    fn test_short_stop_never_increases() {
        let mut book = book();
        let short = TrailingStopSpec::new("AAPL", OrderSide::Buy, 10, Trail::Percent(dec!(2)));
        let id = placed(&mut book, short, dec!(100));
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut last = book.get(&id).unwrap().stop_price;
        for i in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let step = Decimal::from((seed >> 33) % 1000) / dec!(100) - dec!(5);
            let price = (dec!(100) + step * Decimal::from(i % 5)).max(dec!(1));
            tick(&mut book, &id, price, t(i));
            let stop = book.get(&id).unwrap();
            assert!(stop.stop_price <= last, "stop moved up from {} to {}", last, stop.stop_price);
            assert!(stop.stop_price > stop.water_mark);
            last = stop.stop_price;
        }
        assert!(last < dec!(102));
    }

    #[test]
    fn test_fill_and_cancel_are_terminal() {
        let mut book = book();
        let id = placed(&mut book, long(Trail::Amount(dec!(5))), dec!(150));
        book.on_status(&OrderStatusEvent {
            order_id: VenueOrderId::new("T1"),
            symbol: "AAPL".to_string(),
            side: OrderSide::Sell,
            status: OrderStatus::Filled,
            filled_qty: 10,
            remaining_qty: 0,
            avg_price: Some(dec!(145)),
            timestamp: t(0),
        });
        assert_eq!(book.get(&id).unwrap().state, TrailingState::Triggered);
        assert!(book.on_tick("AAPL", dec!(200), t(10)).is_empty());
        assert!(book.cancel(&id).unwrap().is_empty());
        assert!(book.cancel("nope").is_err());
    }

    #[test]
    fn test_flat_position_cancels_after_position_seen() {
        let mut book = book();
        let id = placed(&mut book, long(Trail::Amount(dec!(5))), dec!(150));

        let flat = PortfolioSnapshot::empty(dec!(100000));
        assert!(book.on_account(&flat).is_empty());

        let mut long_book = PortfolioSnapshot::empty(dec!(100000));
        let mut position = crate::portfolio::Position::flat("AAPL");
        position.quantity = 10;
        position.avg_cost = dec!(150);
        long_book.positions.insert("AAPL".to_string(), position);
        assert!(book.on_account(&long_book).is_empty());

        let actions = book.on_account(&flat);
        assert_eq!(
            actions,
            vec![LegAction::Cancel {
                key: LegKey::new(id.clone(), LegRole::TrailingStop),
                order_id: VenueOrderId::new("T1"),
            }]
        );
        assert!(book.on_account(&flat).is_empty());
    }

    #[test]
    fn test_failed_creation_reports_reason() {
        let mut book = book();
        let (provisional, actions) = book.create(long(Trail::Amount(dec!(5))), dec!(150)).unwrap();
        book.on_submit_failed(actions[0].key(), "kill_switch_engaged: halted".to_string());
        assert!(matches!(book.take_outcome(&provisional), Some(Err(_))));
        assert!(book.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let service = CheckpointService::new(Arc::new(MemoryStore::new()));
        let mut book = book();
        let id = placed(&mut book, long(Trail::Amount(dec!(5))), dec!(150));
        tick(&mut book, &id, dec!(160), t(0));
        service.create_checkpoint(&book).await.unwrap();

        let mut restored = self::book();
        assert!(service.restore_checkpoint(&mut restored).await.unwrap());
        let stop = restored.get(&id).unwrap();
        assert_eq!(stop.stop_price, dec!(155));
        assert_eq!(stop.water_mark, dec!(160));

        // the index is rebuilt, so venue events still resolve
        restored.on_status(&OrderStatusEvent {
            order_id: VenueOrderId::new("T1"),
            symbol: "AAPL".to_string(),
            side: OrderSide::Sell,
            status: OrderStatus::Cancelled,
            filled_qty: 0,
            remaining_qty: 10,
            avg_price: None,
            timestamp: t(5),
        });
        assert_eq!(restored.get(&id).unwrap().state, TrailingState::Cancelled);
    }
}
