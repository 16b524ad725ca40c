//! In-process simulated venue
//!
//! Accepts orders, acknowledges them on the bus and fills them either from
//! pushed ticks or through explicit [`SimulatedVenue::fill`] calls. Resting
//! orders are only ever matched against ticks, never against each other.
//! Every request is recorded so tests can assert on exact venue traffic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::traits::{MarketDataFeed, Venue};
use crate::bus::{
    DiagnosticEvent, EventBus, ExecutionEvent, MarketDataEvent, OrderStatusEvent,
};
use crate::domain::{ModifyTerms, OrderIntent, OrderKind, OrderSide, OrderStatus, VenueOrderId};
use crate::error::{BulwarkError, Result};

#[derive(Debug, Clone)]
pub struct SimulatedVenueConfig {
    pub name: String,
    /// Publish a `Submitted` status as soon as an order is accepted
    pub auto_acknowledge: bool,
    /// Match resting orders against pushed ticks
    pub match_on_tick: bool,
    /// Commission charged on tick-driven fills
    pub commission_per_fill: Decimal,
}

impl Default for SimulatedVenueConfig {
    fn default() -> Self {
        Self {
            name: "simulated".to_string(),
            auto_acknowledge: true,
            match_on_tick: true,
            commission_per_fill: Decimal::ZERO,
        }
    }
}

/// Venue-side view of one order
#[derive(Debug, Clone, PartialEq)]
pub struct SimOrder {
    pub order_id: VenueOrderId,
    pub intent: OrderIntent,
    pub status: OrderStatus,
    pub quantity: u64,
    pub filled_qty: u64,
    pub avg_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    stop_triggered: bool,
}

impl SimOrder {
    fn remaining(&self) -> u64 {
        self.quantity.saturating_sub(self.filled_qty)
    }

    /// Price this order would fill at on a tick, if any
    fn match_price(&mut self, price: Decimal) -> Option<Decimal> {
        let side = self.intent.side;
        if matches!(self.intent.kind, OrderKind::Stop | OrderKind::StopLimit) && !self.stop_triggered {
            let stop = self.stop_price?;
            let triggered = match side {
                OrderSide::Sell => price <= stop,
                OrderSide::Buy => price >= stop,
            };
            if !triggered {
                return None;
            }
            self.stop_triggered = true;
        }

        match self.intent.kind {
            OrderKind::Market | OrderKind::Stop => Some(price),
            OrderKind::Limit | OrderKind::StopLimit => {
                let limit = self.limit_price?;
                let marketable = match side {
                    OrderSide::Buy => price <= limit,
                    OrderSide::Sell => price >= limit,
                };
                marketable.then_some(limit)
            }
        }
    }
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    connected: bool,
    orders: BTreeMap<VenueOrderId, SimOrder>,
    submissions: Vec<OrderIntent>,
    cancels: Vec<VenueOrderId>,
    modifications: Vec<(VenueOrderId, ModifyTerms)>,
    subscriptions: HashMap<String, usize>,
    subscribe_calls: Vec<String>,
    unsubscribe_calls: Vec<String>,
    reject_next: usize,
    rejected_symbols: HashSet<String>,
    last_prices: HashMap<String, Decimal>,
}

pub struct SimulatedVenue {
    config: SimulatedVenueConfig,
    bus: EventBus,
    state: Mutex<SimState>,
}

impl SimulatedVenue {
    pub fn new(bus: EventBus) -> Self {
        Self::with_config(bus, SimulatedVenueConfig::default())
    }

    pub fn with_config(bus: EventBus, config: SimulatedVenueConfig) -> Self {
        Self {
            config,
            bus,
            state: Mutex::new(SimState {
                next_id: 1,
                connected: true,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish_status(&self, order: &SimOrder, at: DateTime<Utc>) {
        self.bus.publish(OrderStatusEvent {
            order_id: order.order_id.clone(),
            symbol: order.intent.symbol.clone(),
            side: order.intent.side,
            status: order.status,
            filled_qty: order.filled_qty,
            remaining_qty: order.remaining(),
            avg_price: order.avg_price,
            timestamp: at,
        });
    }

    fn apply_fill(
        &self,
        order: &mut SimOrder,
        qty: u64,
        price: Decimal,
        commission: Decimal,
        at: DateTime<Utc>,
    ) {
        let prior = Decimal::from(order.filled_qty) * order.avg_price.unwrap_or_default();
        order.filled_qty += qty;
        order.avg_price = Some((prior + Decimal::from(qty) * price) / Decimal::from(order.filled_qty));
        order.status = if order.remaining() == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };

        info!(
            venue = %self.config.name,
            order_id = %order.order_id,
            symbol = %order.intent.symbol,
            side = %order.intent.side,
            qty,
            %price,
            status = %order.status,
            "simulated fill"
        );
        self.bus.publish(ExecutionEvent {
            order_id: order.order_id.clone(),
            symbol: order.intent.symbol.clone(),
            side: order.intent.side,
            fill_qty: qty,
            fill_price: price,
            commission,
            timestamp: at,
        });
        self.publish_status(order, at);
    }

    /// Fill some or all of a working order
    pub fn fill(
        &self,
        order_id: &VenueOrderId,
        qty: u64,
        price: Decimal,
        commission: Decimal,
    ) -> Result<()> {
        let mut state = self.state();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BulwarkError::UnknownOrder(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(BulwarkError::VenueRejected(format!(
                "order {} is already {}",
                order_id, order.status
            )));
        }
        if qty == 0 || qty > order.remaining() {
            return Err(BulwarkError::Validation(format!(
                "fill of {} exceeds remaining {} on {}",
                qty,
                order.remaining(),
                order_id
            )));
        }
        self.apply_fill(order, qty, price, commission, Utc::now());
        Ok(())
    }

    /// Publish `Submitted` for an order accepted without auto-acknowledgement
    pub fn acknowledge(&self, order_id: &VenueOrderId) -> Result<()> {
        self.set_status(order_id, OrderStatus::Submitted)
    }

    /// Venue-side rejection after acceptance
    pub fn reject(&self, order_id: &VenueOrderId) -> Result<()> {
        self.set_status(order_id, OrderStatus::Rejected)
    }

    pub fn expire(&self, order_id: &VenueOrderId) -> Result<()> {
        self.set_status(order_id, OrderStatus::Expired)
    }

    fn set_status(&self, order_id: &VenueOrderId, status: OrderStatus) -> Result<()> {
        let mut state = self.state();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BulwarkError::UnknownOrder(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(BulwarkError::VenueRejected(format!(
                "order {} is already {}",
                order_id, order.status
            )));
        }
        order.status = status;
        let order = order.clone();
        self.publish_status(&order, Utc::now());
        Ok(())
    }

    /// Publish a tick and match resting orders against it
    pub fn push_tick(&self, symbol: &str, price: Decimal) {
        self.push_tick_at(symbol, price, Utc::now());
    }

    pub fn push_tick_at(&self, symbol: &str, price: Decimal, at: DateTime<Utc>) {
        let symbol = symbol.to_uppercase();
        let mut state = self.state();
        state.last_prices.insert(symbol.clone(), price);
        self.bus.publish(MarketDataEvent::tick(&symbol, price, at));

        if !self.config.match_on_tick {
            return;
        }
        let commission = self.config.commission_per_fill;
        let ids: Vec<VenueOrderId> = state
            .orders
            .values()
            .filter(|o| o.intent.symbol == symbol && o.status.is_active())
            .map(|o| o.order_id.clone())
            .collect();
        for id in ids {
            if let Some(order) = state.orders.get_mut(&id) {
                if let Some(fill_price) = order.match_price(price) {
                    let qty = order.remaining();
                    self.apply_fill(order, qty, fill_price, commission, at);
                }
            }
        }
    }

    /// Announce a connectivity change on the diagnostic topic
    pub fn set_connected(&self, connected: bool, detail: &str) {
        self.state().connected = connected;
        if connected {
            info!(venue = %self.config.name, detail, "venue connected");
        } else {
            warn!(venue = %self.config.name, detail, "venue disconnected");
        }
        self.bus.publish(DiagnosticEvent::VenueConnectivity {
            connected,
            detail: detail.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Refuse the next `count` submissions
    pub fn reject_next(&self, count: usize) {
        self.state().reject_next = count;
    }

    pub fn reject_symbol(&self, symbol: &str) {
        self.state().rejected_symbols.insert(symbol.to_uppercase());
    }

    pub fn submissions(&self) -> Vec<OrderIntent> {
        self.state().submissions.clone()
    }

    pub fn cancels(&self) -> Vec<VenueOrderId> {
        self.state().cancels.clone()
    }

    pub fn modifications(&self) -> Vec<(VenueOrderId, ModifyTerms)> {
        self.state().modifications.clone()
    }

    pub fn order(&self, order_id: &VenueOrderId) -> Option<SimOrder> {
        self.state().orders.get(order_id).cloned()
    }

    /// Order id of the n-th accepted submission
    pub fn order_id_at(&self, index: usize) -> Option<VenueOrderId> {
        let state = self.state();
        let intent = state.submissions.get(index)?;
        state
            .orders
            .values()
            .find(|o| o.intent.intent_id == intent.intent_id)
            .map(|o| o.order_id.clone())
    }

    pub fn working_orders(&self, symbol: &str) -> Vec<SimOrder> {
        let symbol = symbol.to_uppercase();
        self.state()
            .orders
            .values()
            .filter(|o| o.intent.symbol == symbol && o.status.is_active())
            .cloned()
            .collect()
    }

    pub fn subscription_count(&self, symbol: &str) -> usize {
        self.state()
            .subscriptions
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        self.state().subscribe_calls.clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.state().unsubscribe_calls.clone()
    }

    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.state().last_prices.get(&symbol.to_uppercase()).copied()
    }
}

#[async_trait]
impl Venue for SimulatedVenue {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn submit(&self, intent: &OrderIntent) -> Result<VenueOrderId> {
        intent.validate()?;
        let mut state = self.state();
        if !state.connected {
            return Err(BulwarkError::VenueUnavailable(format!(
                "{} is disconnected",
                self.config.name
            )));
        }
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return Err(BulwarkError::VenueRejected(format!(
                "{} refused {} {} {}",
                self.config.name, intent.side, intent.quantity, intent.symbol
            )));
        }
        if state.rejected_symbols.contains(&intent.symbol) {
            return Err(BulwarkError::VenueRejected(format!(
                "{} is not tradable on {}",
                intent.symbol, self.config.name
            )));
        }

        let order_id = VenueOrderId::new(format!("SIM-{}", state.next_id));
        state.next_id += 1;
        state.submissions.push(intent.clone());

        let order = SimOrder {
            order_id: order_id.clone(),
            intent: intent.clone(),
            status: if self.config.auto_acknowledge {
                OrderStatus::Submitted
            } else {
                OrderStatus::PendingSubmit
            },
            quantity: intent.quantity,
            filled_qty: 0,
            avg_price: None,
            limit_price: intent.limit_price,
            stop_price: intent.stop_price,
            stop_triggered: false,
        };
        debug!(
            venue = %self.config.name,
            %order_id,
            symbol = %intent.symbol,
            side = %intent.side,
            qty = intent.quantity,
            kind = %intent.kind,
            "simulated order accepted"
        );
        if self.config.auto_acknowledge {
            self.publish_status(&order, Utc::now());
        }
        state.orders.insert(order_id.clone(), order);
        Ok(order_id)
    }

    async fn cancel(&self, order_id: &VenueOrderId) -> Result<()> {
        let mut state = self.state();
        state.cancels.push(order_id.clone());
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BulwarkError::UnknownOrder(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(BulwarkError::VenueRejected(format!(
                "cannot cancel {}: already {}",
                order_id, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        let order = order.clone();
        self.publish_status(&order, Utc::now());
        Ok(())
    }

    async fn modify(&self, order_id: &VenueOrderId, terms: ModifyTerms) -> Result<()> {
        let mut state = self.state();
        state.modifications.push((order_id.clone(), terms));
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BulwarkError::UnknownOrder(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(BulwarkError::VenueRejected(format!(
                "cannot modify {}: already {}",
                order_id, order.status
            )));
        }
        if let Some(price) = terms.price {
            match order.intent.kind {
                OrderKind::Stop | OrderKind::StopLimit => order.stop_price = Some(price),
                OrderKind::Limit => order.limit_price = Some(price),
                OrderKind::Market => {}
            }
        }
        if let Some(quantity) = terms.quantity {
            if quantity < order.filled_qty {
                return Err(BulwarkError::VenueRejected(format!(
                    "cannot reduce {} below filled quantity {}",
                    order_id, order.filled_qty
                )));
            }
            order.quantity = quantity;
        }
        debug!(%order_id, price = ?terms.price, quantity = ?terms.quantity, "simulated modify");
        Ok(())
    }
}

#[async_trait]
impl MarketDataFeed for SimulatedVenue {
    async fn subscribe(&self, symbol: &str) -> Result<()> {
        let symbol = symbol.to_uppercase();
        let mut state = self.state();
        state.subscribe_calls.push(symbol.clone());
        *state.subscriptions.entry(symbol).or_insert(0) += 1;
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) -> Result<()> {
        let symbol = symbol.to_uppercase();
        let mut state = self.state();
        state.unsubscribe_calls.push(symbol.clone());
        match state.subscriptions.get_mut(&symbol) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(())
            }
            _ => Err(BulwarkError::Validation(format!(
                "{} is not subscribed",
                symbol
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusEvent, Topic};
    use rust_decimal_macros::dec;

    fn statuses(sub: &mut crate::bus::Subscription) -> Vec<OrderStatus> {
        let mut out = Vec::new();
        while let Some(BusEvent::OrderStatus(e)) = sub.try_recv() {
            out.push(e.status);
        }
        out
    }

    #[tokio::test]
    async fn test_submit_acknowledges_and_fill_publishes() {
        let bus = EventBus::new();
        let mut status = bus.subscribe(Topic::OrderStatus);
        let mut fills = bus.subscribe(Topic::Execution);
        let venue = SimulatedVenue::new(bus.clone());

        let id = venue
            .submit(&OrderIntent::market("AAPL", OrderSide::Buy, 10))
            .await
            .unwrap();
        assert_eq!(id.as_str(), "SIM-1");

        venue.fill(&id, 4, dec!(150), dec!(1)).unwrap();
        venue.fill(&id, 6, dec!(151), dec!(1)).unwrap();
        assert!(venue.fill(&id, 1, dec!(151), dec!(0)).is_err());

        assert_eq!(
            statuses(&mut status),
            vec![
                OrderStatus::Submitted,
                OrderStatus::PartiallyFilled,
                OrderStatus::Filled
            ]
        );
        let mut total = 0;
        while let Some(BusEvent::Execution(e)) = fills.try_recv() {
            total += e.fill_qty;
        }
        assert_eq!(total, 10);
        assert_eq!(venue.order(&id).unwrap().avg_price, Some(dec!(150.6)));
    }

    #[tokio::test]
    async fn test_ticks_trigger_stops_and_limits() {
        let bus = EventBus::new();
        let venue = SimulatedVenue::new(bus.clone());
        let stop = venue
            .submit(&OrderIntent::stop("AAPL", OrderSide::Sell, 10, dec!(145)))
            .await
            .unwrap();
        let target = venue
            .submit(&OrderIntent::limit("AAPL", OrderSide::Sell, 10, dec!(155)))
            .await
            .unwrap();

        venue.push_tick("AAPL", dec!(150));
        assert!(venue.order(&stop).unwrap().status.is_active());

        venue.push_tick("AAPL", dec!(156));
        let filled = venue.order(&target).unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.avg_price, Some(dec!(155)));

        venue.push_tick("AAPL", dec!(144));
        assert_eq!(venue.order(&stop).unwrap().avg_price, Some(dec!(144)));
    }

    #[tokio::test]
    async fn test_cancel_and_modify_are_recorded() {
        let venue = SimulatedVenue::new(EventBus::new());
        let id = venue
            .submit(&OrderIntent::stop("AAPL", OrderSide::Sell, 10, dec!(145)))
            .await
            .unwrap();

        venue.modify(&id, ModifyTerms::price(dec!(150))).await.unwrap();
        assert_eq!(venue.order(&id).unwrap().stop_price, Some(dec!(150)));

        venue.cancel(&id).await.unwrap();
        assert!(venue.cancel(&id).await.is_err());
        assert!(venue.modify(&id, ModifyTerms::price(dec!(151))).await.is_err());
        assert_eq!(venue.cancels().len(), 2);
        assert_eq!(venue.modifications().len(), 2);
    }

    #[tokio::test]
    async fn test_rejections_and_disconnect() {
        let venue = SimulatedVenue::new(EventBus::new());
        venue.reject_next(1);
        let intent = OrderIntent::market("AAPL", OrderSide::Buy, 1);
        assert!(matches!(
            venue.submit(&intent).await,
            Err(BulwarkError::VenueRejected(_))
        ));
        assert!(venue.submit(&intent).await.is_ok());

        venue.set_connected(false, "link down");
        assert!(matches!(
            venue.submit(&intent).await,
            Err(BulwarkError::VenueUnavailable(_))
        ));
        assert_eq!(venue.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_counts() {
        let venue = SimulatedVenue::new(EventBus::new());
        venue.subscribe("aapl").await.unwrap();
        assert_eq!(venue.subscription_count("AAPL"), 1);
        venue.unsubscribe("AAPL").await.unwrap();
        assert!(venue.unsubscribe("AAPL").await.is_err());
        assert_eq!(venue.subscribe_calls(), vec!["AAPL"]);
    }
}
