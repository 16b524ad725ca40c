//! Bracket orders
//!
//! An entry plus two protective exits: a stop-loss (STOP) and a take-profit
//! (LIMIT) on the opposite side. Exits stay local until the entry has been
//! acknowledged and has finished filling; once one exit fills the other is
//! cancelled exactly once.
//!
//! ```text
//! PendingEntry -> EntryWorking -> ExitsWorking -> OneExitFilled -> Closed
//!      \               \
//!       +---------------+--> EntryRejected
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::gateway::OrderGateway;
use super::{emit_transition, scale_quantity, LegAction, LegBook, LegKey};
use crate::bus::{BusEvent, EventBus, OrderStatusEvent, Subscription, Topic};
use crate::domain::{
    LegRole, ModifyTerms, OrderIntent, OrderKind, OrderRecord, OrderSide, OrderStatus,
    VenueOrderId,
};
use crate::error::{BulwarkError, Result};
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketState {
    PendingEntry,
    EntryWorking,
    ExitsWorking,
    OneExitFilled,
    Closed,
    EntryRejected,
}

impl BracketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BracketState::Closed | BracketState::EntryRejected)
    }
}

/// Validated request for a new bracket
#[derive(Debug, Clone)]
pub struct BracketSpec {
    pub group_id: String,
    pub entry: OrderIntent,
    pub stop_loss: OrderIntent,
    pub take_profit: OrderIntent,
}

impl BracketSpec {
    /// Derive both exits from the entry
    pub fn new(entry: OrderIntent, stop_price: Decimal, take_profit_price: Decimal) -> Self {
        let group_id = format!("BRK-{}", entry.intent_id.simple());
        let exit_side = entry.side.opposite();
        let stop_loss = OrderIntent::stop(&entry.symbol, exit_side, entry.quantity, stop_price);
        let take_profit =
            OrderIntent::limit(&entry.symbol, exit_side, entry.quantity, take_profit_price);
        Self::from_legs(group_id, entry, stop_loss, take_profit)
    }

    pub fn from_legs(
        group_id: impl Into<String>,
        entry: OrderIntent,
        stop_loss: OrderIntent,
        take_profit: OrderIntent,
    ) -> Self {
        let group_id = group_id.into();
        let stop_key = format!("{}:{}", group_id, LegRole::StopLoss);
        let target_key = format!("{}:{}", group_id, LegRole::TakeProfit);
        Self {
            entry: entry.with_group(group_id.clone(), LegRole::Entry),
            stop_loss: stop_loss
                .with_group(group_id.clone(), LegRole::StopLoss)
                .with_idempotency_key(stop_key),
            take_profit: take_profit
                .with_group(group_id.clone(), LegRole::TakeProfit)
                .with_idempotency_key(target_key),
            group_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(BulwarkError::Validation("bracket group id is empty".to_string()));
        }
        self.entry.validate()?;
        self.stop_loss.validate()?;
        self.take_profit.validate()?;

        let exit_side = self.entry.side.opposite();
        for (name, exit) in [("stop-loss", &self.stop_loss), ("take-profit", &self.take_profit)] {
            if exit.side != exit_side {
                return Err(BulwarkError::Validation(format!(
                    "{} must be {} for a {} entry",
                    name, exit_side, self.entry.side
                )));
            }
            if exit.quantity != self.entry.quantity {
                return Err(BulwarkError::Validation(format!(
                    "{} quantity {} differs from entry quantity {}",
                    name, exit.quantity, self.entry.quantity
                )));
            }
            if exit.symbol != self.entry.symbol {
                return Err(BulwarkError::Validation(format!(
                    "{} symbol {} differs from entry symbol {}",
                    name, exit.symbol, self.entry.symbol
                )));
            }
        }
        if self.stop_loss.kind != OrderKind::Stop {
            return Err(BulwarkError::Validation(
                "stop-loss must be a STOP order".to_string(),
            ));
        }
        if self.take_profit.kind != OrderKind::Limit {
            return Err(BulwarkError::Validation(
                "take-profit must be a LIMIT order".to_string(),
            ));
        }

        let (Some(stop), Some(target)) = (self.stop_loss.stop_price, self.take_profit.limit_price)
        else {
            return Err(BulwarkError::Validation(
                "bracket exits need stop and limit prices".to_string(),
            ));
        };
        let ordered = match self.entry.side {
            OrderSide::Buy => stop < target,
            OrderSide::Sell => stop > target,
        };
        if !ordered {
            return Err(BulwarkError::Validation(format!(
                "stop {} and take-profit {} are on the wrong sides for a {} entry",
                stop, target, self.entry.side
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BracketGroup {
    pub id: String,
    pub state: BracketState,
    pub entry: OrderRecord,
    pub stop_loss: OrderRecord,
    pub take_profit: OrderRecord,
    pub exits_transmitted: bool,
    pub cancel_requested: bool,
    pub anomaly: Option<String>,
    pub opened_at: DateTime<Utc>,
}

impl BracketGroup {
    pub fn symbol(&self) -> &str {
        self.entry.symbol()
    }

    pub fn leg(&self, role: LegRole) -> Option<&OrderRecord> {
        match role {
            LegRole::Entry => Some(&self.entry),
            LegRole::StopLoss => Some(&self.stop_loss),
            LegRole::TakeProfit => Some(&self.take_profit),
            _ => None,
        }
    }

    fn leg_mut(&mut self, role: LegRole) -> Option<&mut OrderRecord> {
        match role {
            LegRole::Entry => Some(&mut self.entry),
            LegRole::StopLoss => Some(&mut self.stop_loss),
            LegRole::TakeProfit => Some(&mut self.take_profit),
            _ => None,
        }
    }
}

fn sibling_exit(role: LegRole) -> LegRole {
    match role {
        LegRole::StopLoss => LegRole::TakeProfit,
        _ => LegRole::StopLoss,
    }
}

fn set_state(telemetry: &Telemetry, group: &mut BracketGroup, to: BracketState) {
    if group.state == to {
        return;
    }
    emit_transition(telemetry, "bracket", &group.id, group.symbol(), group.state, to);
    group.state = to;
}

/// Arena of bracket groups
pub struct BracketBook {
    groups: HashMap<String, BracketGroup>,
    index: HashMap<VenueOrderId, LegKey>,
    telemetry: Telemetry,
}

impl BracketBook {
    pub fn new(telemetry: Telemetry) -> Self {
        Self {
            groups: HashMap::new(),
            index: HashMap::new(),
            telemetry,
        }
    }

    pub fn get(&self, group_id: &str) -> Option<&BracketGroup> {
        self.groups.get(group_id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &BracketGroup> {
        self.groups.values()
    }

    pub fn leg_for(&self, order_id: &VenueOrderId) -> Option<&LegKey> {
        self.index.get(order_id)
    }

    /// Register a bracket; the only action is the entry submission
    pub fn open(&mut self, spec: BracketSpec) -> Result<Vec<LegAction>> {
        spec.validate()?;
        if self.groups.contains_key(&spec.group_id) {
            return Err(BulwarkError::DuplicateGroup(spec.group_id));
        }

        let key = LegKey::new(spec.group_id.clone(), LegRole::Entry);
        let entry = spec.entry.clone();
        info!(
            group_id = %spec.group_id,
            symbol = %entry.symbol,
            side = %entry.side,
            qty = entry.quantity,
            stop = ?spec.stop_loss.stop_price,
            target = ?spec.take_profit.limit_price,
            "bracket opened"
        );
        self.groups.insert(
            spec.group_id.clone(),
            BracketGroup {
                id: spec.group_id,
                state: BracketState::PendingEntry,
                entry: OrderRecord::new(spec.entry),
                stop_loss: OrderRecord::new(spec.stop_loss),
                take_profit: OrderRecord::new(spec.take_profit),
                exits_transmitted: false,
                cancel_requested: false,
                anomaly: None,
                opened_at: Utc::now(),
            },
        );
        Ok(vec![LegAction::Submit { key, intent: entry }])
    }

    pub fn on_status(&mut self, event: &OrderStatusEvent) -> Vec<LegAction> {
        let Some(key) = self.index.get(&event.order_id).cloned() else {
            return Vec::new();
        };
        let Some(group) = self.groups.get_mut(&key.group_id) else {
            return Vec::new();
        };
        let Some(record) = group.leg_mut(key.role) else {
            return Vec::new();
        };
        if !record.apply_status(event.status, event.filled_qty, event.avg_price, event.timestamp) {
            debug!(leg = %key, status = %event.status, "status after terminal ignored");
            return Vec::new();
        }

        match key.role {
            LegRole::Entry => Self::entry_update(&self.telemetry, group),
            role => Self::exit_update(&self.telemetry, group, role),
        }
    }

    fn entry_update(telemetry: &Telemetry, group: &mut BracketGroup) -> Vec<LegAction> {
        let status = group.entry.status;
        let filled = group.entry.filled_qty;
        match status {
            OrderStatus::Submitted | OrderStatus::PartiallyFilled => {
                if group.state == BracketState::PendingEntry {
                    set_state(telemetry, group, BracketState::EntryWorking);
                }
                Vec::new()
            }
            OrderStatus::Filled => Self::transmit_exits(telemetry, group, filled),
            OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Rejected => {
                if filled > 0 {
                    info!(
                        group_id = %group.id,
                        filled,
                        ordered = group.entry.intent.quantity,
                        %status,
                        "entry ended after a partial fill; protecting the filled quantity"
                    );
                    Self::transmit_exits(telemetry, group, filled)
                } else {
                    warn!(group_id = %group.id, %status, "entry ended without a fill");
                    set_state(telemetry, group, BracketState::EntryRejected);
                    Vec::new()
                }
            }
            OrderStatus::PendingSubmit => Vec::new(),
        }
    }

    fn transmit_exits(telemetry: &Telemetry, group: &mut BracketGroup, filled: u64) -> Vec<LegAction> {
        if group.exits_transmitted || group.state.is_terminal() {
            return Vec::new();
        }
        let ordered = group.entry.intent.quantity;
        let mut actions = Vec::with_capacity(2);
        for role in [LegRole::StopLoss, LegRole::TakeProfit] {
            let key = LegKey::new(group.id.clone(), role);
            if let Some(exit) = group.leg_mut(role) {
                let qty = scale_quantity(exit.intent.quantity, filled, ordered);
                *exit = OrderRecord::new(exit.intent.with_quantity(qty));
                actions.push(LegAction::Submit {
                    key,
                    intent: exit.intent.clone(),
                });
            }
        }
        group.exits_transmitted = true;
        set_state(telemetry, group, BracketState::ExitsWorking);
        actions
    }

    fn exit_update(telemetry: &Telemetry, group: &mut BracketGroup, role: LegRole) -> Vec<LegAction> {
        let other_role = sibling_exit(role);
        let (this_status, other_status, other_id) = match (group.leg(role), group.leg(other_role)) {
            (Some(this), Some(other)) => (this.status, other.status, other.order_id.clone()),
            _ => return Vec::new(),
        };

        match this_status {
            OrderStatus::Filled => {
                if other_status == OrderStatus::Filled {
                    error!(
                        group_id = %group.id,
                        symbol = %group.symbol(),
                        "both bracket exits filled; position needs manual review"
                    );
                    group.anomaly = Some("both_exits_filled".to_string());
                    telemetry.error(
                        "bracket.both_exits_filled",
                        serde_json::json!({
                            "group_id": group.id,
                            "symbol": group.symbol(),
                            "stop_loss_filled": group.stop_loss.filled_qty,
                            "take_profit_filled": group.take_profit.filled_qty,
                        }),
                    );
                    set_state(telemetry, group, BracketState::Closed);
                    return Vec::new();
                }

                set_state(telemetry, group, BracketState::OneExitFilled);
                match other_id {
                    Some(order_id) if !other_status.is_terminal() => {
                        if group.cancel_requested {
                            return Vec::new();
                        }
                        group.cancel_requested = true;
                        info!(group_id = %group.id, filled = %role, cancel = %order_id, "exit filled; cancelling sibling");
                        vec![LegAction::Cancel {
                            key: LegKey::new(group.id.clone(), other_role),
                            order_id,
                        }]
                    }
                    _ => {
                        set_state(telemetry, group, BracketState::Closed);
                        Vec::new()
                    }
                }
            }
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired => {
                if group.state == BracketState::OneExitFilled || other_status.is_terminal() {
                    if other_status != OrderStatus::Filled {
                        warn!(group_id = %group.id, "both exits ended without a fill; position is unprotected");
                    }
                    set_state(telemetry, group, BracketState::Closed);
                } else {
                    warn!(
                        group_id = %group.id,
                        exit = %role,
                        status = %this_status,
                        "exit ended early; sibling stays working"
                    );
                }
                Vec::new()
            }
            OrderStatus::PartiallyFilled => Self::resize_sibling(group, role),
            _ => Vec::new(),
        }
    }

    /// Shrink the working sibling to what the partially filled exit still covers
    fn resize_sibling(group: &mut BracketGroup, role: LegRole) -> Vec<LegAction> {
        let other_role = sibling_exit(role);
        let Some(covered) = group
            .leg(role)
            .map(|this| this.intent.quantity.saturating_sub(this.filled_qty))
        else {
            return Vec::new();
        };
        let Some(other) = group.leg_mut(other_role) else {
            return Vec::new();
        };
        let Some(order_id) = other.order_id.clone() else {
            return Vec::new();
        };
        if other.is_terminal()
            || covered == 0
            || other.intent.quantity <= covered
            || other.filled_qty > covered
        {
            return Vec::new();
        }

        let from = other.intent.quantity;
        other.intent = other.intent.with_quantity(covered);
        info!(
            group_id = %group.id,
            partial = %role,
            resize = %order_id,
            from,
            to = covered,
            "exit partially filled; shrinking sibling"
        );
        vec![LegAction::Modify {
            key: LegKey::new(group.id.clone(), other_role),
            order_id,
            terms: ModifyTerms::quantity(covered),
        }]
    }
}

impl LegBook for BracketBook {
    fn on_submitted(&mut self, key: &LegKey, order_id: VenueOrderId, sent: OrderIntent) -> Vec<LegAction> {
        let Some(group) = self.groups.get_mut(&key.group_id) else {
            warn!(leg = %key, %order_id, "submission for unknown bracket");
            return Vec::new();
        };

        if key.role == LegRole::Entry && sent.quantity < group.entry.intent.quantity {
            let ordered = group.entry.intent.quantity;
            info!(
                group_id = %group.id,
                ordered,
                sent = sent.quantity,
                "entry clipped by risk; exits reduced to match"
            );
            for role in [LegRole::StopLoss, LegRole::TakeProfit] {
                if let Some(exit) = group.leg_mut(role) {
                    let qty = scale_quantity(exit.intent.quantity, sent.quantity, ordered);
                    exit.intent = exit.intent.with_quantity(qty);
                }
            }
        }

        if let Some(record) = group.leg_mut(key.role) {
            record.intent = sent;
            record.mark_submitted(order_id.clone());
        }
        debug!(leg = %key, %order_id, "bracket leg placed");
        self.index.insert(order_id, key.clone());
        Vec::new()
    }

    fn on_submit_failed(&mut self, key: &LegKey, reason: String) -> Vec<LegAction> {
        let Some(group) = self.groups.get_mut(&key.group_id) else {
            return Vec::new();
        };
        if let Some(record) = group.leg_mut(key.role) {
            record.mark_terminal(OrderStatus::Rejected);
        }

        if key.role == LegRole::Entry {
            warn!(group_id = %group.id, %reason, "bracket entry rejected; exits discarded");
            set_state(&self.telemetry, group, BracketState::EntryRejected);
            return Vec::new();
        }

        error!(
            group_id = %group.id,
            exit = %key.role,
            %reason,
            "bracket exit could not be placed"
        );
        self.telemetry.error(
            "bracket.exit_submit_failed",
            serde_json::json!({
                "group_id": group.id,
                "symbol": group.symbol(),
                "role": key.role.to_string(),
                "reason": reason,
            }),
        );
        let sibling_dead = group
            .leg(sibling_exit(key.role))
            .map(|r| r.is_terminal())
            .unwrap_or(true);
        if sibling_dead {
            set_state(&self.telemetry, group, BracketState::Closed);
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
            // a fill racing the cancel shows up as a status event
            warn!(leg = %key, %order_id, error = %e, "bracket cancel not confirmed");
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
        if let Err(e) = result {
            // the record keeps the requested size; fills still arrive as status events
            warn!(leg = %key, %order_id, error = %e, "sibling exit resize not confirmed");
            self.telemetry.warning(
                "bracket.exit_resize_failed",
                serde_json::json!({
                    "group_id": key.group_id,
                    "role": key.role.to_string(),
                    "order_id": order_id.to_string(),
                    "quantity": terms.quantity,
                    "error": e.to_string(),
                }),
            );
        }
        Vec::new()
    }
}

enum BracketCommand {
    Submit {
        spec: BracketSpec,
        reply: oneshot::Sender<Result<BracketGroup>>,
    },
    Get {
        group_id: String,
        reply: oneshot::Sender<Option<BracketGroup>>,
    },
}

/// Clonable front end of the bracket manager
#[derive(Clone)]
pub struct BracketHandle {
    tx: mpsc::Sender<BracketCommand>,
}

impl BracketHandle {
    /// Open a bracket and wait for the entry submission to settle
    pub async fn submit(&self, spec: BracketSpec) -> Result<BracketGroup> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(BracketCommand::Submit { spec, reply }).await?;
        rx.await?
    }

    pub async fn get(&self, group_id: &str) -> Result<Option<BracketGroup>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BracketCommand::Get {
                group_id: group_id.to_string(),
                reply,
            })
            .await?;
        Ok(rx.await?)
    }
}

pub struct BracketManager {
    book: BracketBook,
    gateway: OrderGateway,
    statuses: Subscription,
    commands: mpsc::Receiver<BracketCommand>,
}

impl BracketManager {
    pub fn new(bus: &EventBus, gateway: OrderGateway, telemetry: Telemetry) -> (Self, BracketHandle) {
        let (tx, commands) = mpsc::channel(64);
        let manager = Self {
            book: BracketBook::new(telemetry),
            gateway,
            statuses: bus.subscribe(Topic::OrderStatus),
            commands,
        };
        (manager, BracketHandle { tx })
    }

    async fn handle_command(&mut self, command: BracketCommand) {
        match command {
            BracketCommand::Submit { spec, reply } => {
                let group_id = spec.group_id.clone();
                let result = match self.book.open(spec) {
                    Ok(actions) => {
                        self.gateway.drive(&mut self.book, actions).await;
                        self.book
                            .get(&group_id)
                            .cloned()
                            .ok_or(BulwarkError::UnknownGroup(group_id))
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            BracketCommand::Get { group_id, reply } => {
                let _ = reply.send(self.book.get(&group_id).cloned());
            }
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("bracket manager starting");
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                Some(event) = self.statuses.recv() => {
                    if let BusEvent::OrderStatus(status) = event {
                        let actions = self.book.on_status(&status);
                        self.gateway.drive(&mut self.book, actions).await;
                    }
                }

                Some(command) = self.commands.recv() => self.handle_command(command).await,

                else => break,
            }
        }
        let open = self.book.groups().filter(|g| !g.state.is_terminal()).count();
        if open > 0 {
            warn!(open, "bracket manager stopping with open groups");
        }
        info!("bracket manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use rust_decimal_macros::dec;

    fn spec() -> BracketSpec {
        let entry = OrderIntent::market("AAPL", OrderSide::Buy, 10).with_expected_price(dec!(150));
        BracketSpec::new(entry, dec!(145), dec!(155))
    }

    fn status(order_id: &str, status: OrderStatus, filled: u64) -> OrderStatusEvent {
        OrderStatusEvent {
            order_id: VenueOrderId::new(order_id),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            status,
            filled_qty: filled,
            remaining_qty: 0,
            avg_price: None,
            timestamp: Utc::now(),
        }
    }

    /// Accept every submit with ids E, S, T in order
    fn place_all(book: &mut BracketBook, actions: Vec<LegAction>, ids: &[&str]) {
        for (action, id) in actions.into_iter().zip(ids) {
            if let LegAction::Submit { key, intent } = action {
                book.on_submitted(&key, VenueOrderId::new(*id), intent);
            }
        }
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec().validate().is_ok());

        let entry = OrderIntent::market("AAPL", OrderSide::Buy, 10);
        assert!(BracketSpec::new(entry.clone(), dec!(155), dec!(145)).validate().is_err());

        let short = OrderIntent::market("AAPL", OrderSide::Sell, 10);
        assert!(BracketSpec::new(short, dec!(155), dec!(145)).validate().is_ok());

        let wrong_side = BracketSpec::from_legs(
            "g",
            entry.clone(),
            OrderIntent::stop("AAPL", OrderSide::Buy, 10, dec!(145)),
            OrderIntent::limit("AAPL", OrderSide::Sell, 10, dec!(155)),
        );
        assert!(wrong_side.validate().is_err());

        let wrong_qty = BracketSpec::from_legs(
            "g",
            entry,
            OrderIntent::stop("AAPL", OrderSide::Sell, 5, dec!(145)),
            OrderIntent::limit("AAPL", OrderSide::Sell, 10, dec!(155)),
        );
        assert!(wrong_qty.validate().is_err());
    }

    #[test]
    fn test_exits_wait_for_entry_fill() {
        let mut book = BracketBook::new(Telemetry::disabled());
        let spec = spec();
        let id = spec.group_id.clone();

        let actions = book.open(spec).unwrap();
        assert_eq!(actions.len(), 1);
        place_all(&mut book, actions, &["E"]);
        assert_eq!(book.get(&id).unwrap().state, BracketState::PendingEntry);

        assert!(book.on_status(&status("E", OrderStatus::Submitted, 0)).is_empty());
        assert_eq!(book.get(&id).unwrap().state, BracketState::EntryWorking);

        assert!(book.on_status(&status("E", OrderStatus::PartiallyFilled, 4)).is_empty());

        let exits = book.on_status(&status("E", OrderStatus::Filled, 10));
        assert_eq!(exits.len(), 2);
        for action in &exits {
            match action {
                LegAction::Submit { intent, .. } => {
                    assert_eq!(intent.quantity, 10);
                    assert_eq!(intent.side, OrderSide::Sell);
                }
                other => panic!("unexpected action {:?}", other),
            }
        }
        assert_eq!(book.get(&id).unwrap().state, BracketState::ExitsWorking);
        place_all(&mut book, exits, &["S", "T"]);

        let cancel = book.on_status(&status("T", OrderStatus::Filled, 10));
        assert_eq!(
            cancel,
            vec![LegAction::Cancel {
                key: LegKey::new(id.clone(), LegRole::StopLoss),
                order_id: VenueOrderId::new("S"),
            }]
        );
        assert_eq!(book.get(&id).unwrap().state, BracketState::OneExitFilled);

        // duplicate fill report does not cancel again
        assert!(book.on_status(&status("T", OrderStatus::Filled, 10)).is_empty());

        book.on_status(&status("S", OrderStatus::Cancelled, 0));
        assert_eq!(book.get(&id).unwrap().state, BracketState::Closed);
    }

    #[test]
    fn test_partial_exit_shrinks_sibling() {
        let mut book = BracketBook::new(Telemetry::disabled());
        let spec = spec();
        let id = spec.group_id.clone();

        let actions = book.open(spec).unwrap();
        place_all(&mut book, actions, &["E"]);
        let exits = book.on_status(&status("E", OrderStatus::Filled, 10));
        place_all(&mut book, exits, &["S", "T"]);

        let resize = book.on_status(&status("T", OrderStatus::PartiallyFilled, 4));
        assert_eq!(
            resize,
            vec![LegAction::Modify {
                key: LegKey::new(id.clone(), LegRole::StopLoss),
                order_id: VenueOrderId::new("S"),
                terms: ModifyTerms::quantity(6),
            }]
        );
        assert_eq!(book.get(&id).unwrap().stop_loss.intent.quantity, 6);

        // same fill level again needs no further resize
        assert!(book.on_status(&status("T", OrderStatus::PartiallyFilled, 4)).is_empty());

        let resize = book.on_status(&status("T", OrderStatus::PartiallyFilled, 7));
        assert_eq!(resize.len(), 1);
        assert_eq!(book.get(&id).unwrap().stop_loss.intent.quantity, 3);

        let cancel = book.on_status(&status("T", OrderStatus::Filled, 10));
        assert!(matches!(cancel.as_slice(), [LegAction::Cancel { .. }]));
    }

    #[test]
    fn test_rejected_entry_discards_exits() {
        let mut book = BracketBook::new(Telemetry::disabled());
        let spec = spec();
        let id = spec.group_id.clone();
        let actions = book.open(spec).unwrap();
        let key = actions[0].key().clone();

        assert!(book.on_submit_failed(&key, "risk".to_string()).is_empty());
        let group = book.get(&id).unwrap();
        assert_eq!(group.state, BracketState::EntryRejected);
        assert!(group.stop_loss.order_id.is_none());
        assert!(group.take_profit.order_id.is_none());
    }

    #[test]
    fn test_venue_rejection_after_ack() {
        let mut book = BracketBook::new(Telemetry::disabled());
        let spec = spec();
        let id = spec.group_id.clone();
        let actions = book.open(spec).unwrap();
        place_all(&mut book, actions, &["E"]);

        assert!(book.on_status(&status("E", OrderStatus::Rejected, 0)).is_empty());
        assert_eq!(book.get(&id).unwrap().state, BracketState::EntryRejected);
        // later fills for a rejected entry are ignored
        assert!(book.on_status(&status("E", OrderStatus::Filled, 10)).is_empty());
    }

    #[test]
    fn test_partial_entry_protects_filled_quantity() {
        let mut book = BracketBook::new(Telemetry::disabled());
        let actions = book.open(spec()).unwrap();
        place_all(&mut book, actions, &["E"]);
        book.on_status(&status("E", OrderStatus::PartiallyFilled, 4));

        let exits = book.on_status(&status("E", OrderStatus::Cancelled, 4));
        assert_eq!(exits.len(), 2);
        for action in exits {
            if let LegAction::Submit { intent, .. } = action {
                assert_eq!(intent.quantity, 4);
            }
        }
    }

    #[test]
    fn test_clipped_entry_shrinks_exits() {
        let mut book = BracketBook::new(Telemetry::disabled());
        let spec = spec();
        let id = spec.group_id.clone();
        let actions = book.open(spec).unwrap();
        if let LegAction::Submit { key, intent } = &actions[0] {
            book.on_submitted(key, VenueOrderId::new("E"), intent.with_quantity(6));
        }
        let group = book.get(&id).unwrap();
        assert_eq!(group.stop_loss.intent.quantity, 6);
        assert_eq!(group.take_profit.intent.quantity, 6);

        let exits = book.on_status(&status("E", OrderStatus::Filled, 6));
        for action in exits {
            if let LegAction::Submit { intent, .. } = action {
                assert_eq!(intent.quantity, 6);
            }
        }
    }

    #[test]
    fn test_exit_submit_failure_keeps_survivor() {
        let mut book = BracketBook::new(Telemetry::disabled());
        let spec = spec();
        let id = spec.group_id.clone();
        let actions = book.open(spec).unwrap();
        place_all(&mut book, actions, &["E"]);
        let exits = book.on_status(&status("E", OrderStatus::Filled, 10));

        book.on_submitted(exits[0].key(), VenueOrderId::new("S"), match &exits[0] {
            LegAction::Submit { intent, .. } => intent.clone(),
            _ => unreachable!(),
        });
        book.on_submit_failed(exits[1].key(), "venue down".to_string());

        let group = book.get(&id).unwrap();
        assert_eq!(group.state, BracketState::ExitsWorking);
        assert_eq!(group.take_profit.status, OrderStatus::Rejected);
        assert!(group.stop_loss.status.is_active());
    }

    #[tokio::test]
    async fn test_both_exits_filled_is_an_anomaly() {
        let sink = MemorySink::new();
        let (telemetry, forwarder) = Telemetry::spawn(sink.clone(), 64);
        let mut book = BracketBook::new(telemetry);
        let spec = spec();
        let id = spec.group_id.clone();

        let actions = book.open(spec).unwrap();
        place_all(&mut book, actions, &["E"]);
        let exits = book.on_status(&status("E", OrderStatus::Filled, 10));
        place_all(&mut book, exits, &["S", "T"]);

        assert_eq!(book.on_status(&status("S", OrderStatus::Filled, 10)).len(), 1);
        assert!(book.on_status(&status("T", OrderStatus::Filled, 10)).is_empty());

        let group = book.get(&id).unwrap();
        assert_eq!(group.state, BracketState::Closed);
        assert_eq!(group.anomaly.as_deref(), Some("both_exits_filled"));

        drop(book);
        forwarder.await.unwrap();
        assert_eq!(sink.named("bracket.both_exits_filled").len(), 1);
        assert!(!sink.named("bracket.transition").is_empty());
    }

    #[test]
    fn test_duplicate_group_refused() {
        let mut book = BracketBook::new(Telemetry::disabled());
        let spec = spec();
        book.open(spec.clone()).unwrap();
        assert!(matches!(book.open(spec), Err(BulwarkError::DuplicateGroup(_))));
    }
}
