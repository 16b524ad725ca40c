//! One-cancels-other groups
//!
//! Two working orders on the same symbol. The second leg is only sent
//! after the first has been placed; from then on the first terminal event
//! on either leg cancels the other. Both legs filling before the cancel
//! lands is kept as the `BothFilledRace` state and left to the operator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::gateway::OrderGateway;
use super::{emit_transition, LegAction, LegBook, LegKey};
use crate::bus::{BusEvent, EventBus, OrderStatusEvent, Subscription, Topic};
use crate::domain::{LegRole, ModifyTerms, OrderIntent, OrderRecord, OrderStatus, VenueOrderId};
use crate::error::{BulwarkError, Result};
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcoState {
    /// First leg in flight, second not yet sent
    Pending,
    BothWorking,
    OneFilled,
    Closed,
    BothFilledRace,
}

impl OcoState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OcoState::Closed | OcoState::BothFilledRace)
    }
}

#[derive(Debug, Clone)]
pub struct OcoSpec {
    pub group_id: String,
    pub first: OrderIntent,
    pub second: OrderIntent,
}

impl OcoSpec {
    pub fn new(group_id: impl Into<String>, first: OrderIntent, second: OrderIntent) -> Self {
        let group_id = group_id.into();
        Self {
            first: first.with_group(group_id.clone(), LegRole::OcoFirst),
            second: second.with_group(group_id.clone(), LegRole::OcoSecond),
            group_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(BulwarkError::Validation("OCO group id is empty".to_string()));
        }
        self.first.validate()?;
        self.second.validate()?;
        if self.first.symbol != self.second.symbol {
            return Err(BulwarkError::Validation(format!(
                "OCO legs trade different symbols: {} and {}",
                self.first.symbol, self.second.symbol
            )));
        }
        if self.first.quantity != self.second.quantity {
            return Err(BulwarkError::Validation(format!(
                "OCO legs have different quantities: {} and {}",
                self.first.quantity, self.second.quantity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OcoGroup {
    pub id: String,
    pub state: OcoState,
    pub first: OrderRecord,
    pub second: OrderRecord,
    pub cancel_sent: bool,
    pub opened_at: DateTime<Utc>,
}

impl OcoGroup {
    pub fn symbol(&self) -> &str {
        self.first.symbol()
    }

    pub fn leg(&self, role: LegRole) -> Option<&OrderRecord> {
        match role {
            LegRole::OcoFirst => Some(&self.first),
            LegRole::OcoSecond => Some(&self.second),
            _ => None,
        }
    }

    fn leg_mut(&mut self, role: LegRole) -> Option<&mut OrderRecord> {
        match role {
            LegRole::OcoFirst => Some(&mut self.first),
            LegRole::OcoSecond => Some(&mut self.second),
            _ => None,
        }
    }

    /// Cancel for the sibling of `role`, at most once per group
    fn cancel_sibling(&mut self, role: LegRole) -> Vec<LegAction> {
        let sibling_role = sibling(role);
        let Some(sibling) = self.leg(sibling_role) else {
            return Vec::new();
        };
        if self.cancel_sent || sibling.is_terminal() {
            return Vec::new();
        }
        let Some(order_id) = sibling.order_id.clone() else {
            return Vec::new();
        };
        self.cancel_sent = true;
        vec![LegAction::Cancel {
            key: LegKey::new(self.id.clone(), sibling_role),
            order_id,
        }]
    }
}

fn sibling(role: LegRole) -> LegRole {
    match role {
        LegRole::OcoFirst => LegRole::OcoSecond,
        _ => LegRole::OcoFirst,
    }
}

fn set_state(telemetry: &Telemetry, group: &mut OcoGroup, to: OcoState) {
    if group.state == to {
        return;
    }
    emit_transition(telemetry, "oco", &group.id, group.symbol(), group.state, to);
    group.state = to;
}

pub struct OcoBook {
    groups: HashMap<String, OcoGroup>,
    index: HashMap<VenueOrderId, LegKey>,
    telemetry: Telemetry,
}

impl OcoBook {
    pub fn new(telemetry: Telemetry) -> Self {
        Self {
            groups: HashMap::new(),
            index: HashMap::new(),
            telemetry,
        }
    }

    pub fn get(&self, group_id: &str) -> Option<&OcoGroup> {
        self.groups.get(group_id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &OcoGroup> {
        self.groups.values()
    }

    pub fn open(&mut self, spec: OcoSpec) -> Result<Vec<LegAction>> {
        spec.validate()?;
        if self.groups.contains_key(&spec.group_id) {
            return Err(BulwarkError::DuplicateGroup(spec.group_id));
        }
        info!(
            group_id = %spec.group_id,
            symbol = %spec.first.symbol,
            first = %spec.first.kind,
            second = %spec.second.kind,
            "OCO group opened"
        );
        let first = spec.first.clone();
        let key = LegKey::new(spec.group_id.clone(), LegRole::OcoFirst);
        self.groups.insert(
            spec.group_id.clone(),
            OcoGroup {
                id: spec.group_id,
                state: OcoState::Pending,
                first: OrderRecord::new(spec.first),
                second: OrderRecord::new(spec.second),
                cancel_sent: false,
                opened_at: Utc::now(),
            },
        );
        Ok(vec![LegAction::Submit { key, intent: first }])
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
            debug!(leg = %key, status = %event.status, "duplicate terminal report ignored");
            return Vec::new();
        }

        let sibling_status = group.leg(sibling(key.role)).map(|r| r.status);
        match event.status {
            OrderStatus::Filled => {
                if sibling_status == Some(OrderStatus::Filled) {
                    warn!(
                        group_id = %group.id,
                        symbol = %group.symbol(),
                        "both OCO legs filled before the cancel landed"
                    );
                    self.telemetry.warning(
                        "oco.both_filled_race",
                        serde_json::json!({
                            "group_id": group.id,
                            "symbol": group.symbol(),
                            "first_filled": group.first.filled_qty,
                            "second_filled": group.second.filled_qty,
                        }),
                    );
                    set_state(&self.telemetry, group, OcoState::BothFilledRace);
                    return Vec::new();
                }
                if group.state.is_terminal() {
                    warn!(group_id = %group.id, leg = %key.role, "fill on a closed OCO group");
                    return Vec::new();
                }
                set_state(&self.telemetry, group, OcoState::OneFilled);
                let actions = group.cancel_sibling(key.role);
                if actions.is_empty() && sibling_status.map(|s| s.is_terminal()).unwrap_or(true) {
                    set_state(&self.telemetry, group, OcoState::Closed);
                }
                actions
            }
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired => {
                if group.state.is_terminal() {
                    return Vec::new();
                }
                if group.state != OcoState::OneFilled {
                    info!(
                        group_id = %group.id,
                        leg = %key.role,
                        status = %event.status,
                        "OCO leg ended; cancelling sibling"
                    );
                }
                let actions = group.cancel_sibling(key.role);
                set_state(&self.telemetry, group, OcoState::Closed);
                actions
            }
            _ => Vec::new(),
        }
    }
}

impl LegBook for OcoBook {
    fn on_submitted(&mut self, key: &LegKey, order_id: VenueOrderId, sent: OrderIntent) -> Vec<LegAction> {
        let Some(group) = self.groups.get_mut(&key.group_id) else {
            return Vec::new();
        };
        if let Some(record) = group.leg_mut(key.role) {
            record.intent = sent;
            record.mark_submitted(order_id.clone());
        }
        self.index.insert(order_id, key.clone());

        match key.role {
            LegRole::OcoFirst => vec![LegAction::Submit {
                key: LegKey::new(group.id.clone(), LegRole::OcoSecond),
                intent: group.second.intent.clone(),
            }],
            _ => {
                set_state(&self.telemetry, group, OcoState::BothWorking);
                Vec::new()
            }
        }
    }

    fn on_submit_failed(&mut self, key: &LegKey, reason: String) -> Vec<LegAction> {
        let Some(group) = self.groups.get_mut(&key.group_id) else {
            return Vec::new();
        };
        warn!(group_id = %group.id, leg = %key.role, %reason, "OCO leg could not be placed");
        if let Some(record) = group.leg_mut(key.role) {
            record.mark_terminal(OrderStatus::Rejected);
        }
        if key.role == LegRole::OcoFirst {
            // the second leg is never sent
            group.second.mark_terminal(OrderStatus::Rejected);
        }
        let actions = group.cancel_sibling(key.role);
        set_state(&self.telemetry, group, OcoState::Closed);
        actions
    }

    fn on_cancel_result(
        &mut self,
        key: &LegKey,
        order_id: &VenueOrderId,
        result: &Result<()>,
    ) -> Vec<LegAction> {
        if let Err(e) = result {
            warn!(leg = %key, %order_id, error = %e, "OCO sibling cancel not confirmed");
        }
        Vec::new()
    }

    fn on_modify_result(
        &mut self,
        _key: &LegKey,
        _order_id: &VenueOrderId,
        _terms: ModifyTerms,
        _result: &Result<()>,
    ) -> Vec<LegAction> {
        Vec::new()
    }
}

enum OcoCommand {
    Submit {
        spec: OcoSpec,
        reply: oneshot::Sender<Result<OcoGroup>>,
    },
    Get {
        group_id: String,
        reply: oneshot::Sender<Option<OcoGroup>>,
    },
}

#[derive(Clone)]
pub struct OcoHandle {
    tx: mpsc::Sender<OcoCommand>,
}

impl OcoHandle {
    pub async fn submit(&self, spec: OcoSpec) -> Result<OcoGroup> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(OcoCommand::Submit { spec, reply }).await?;
        rx.await?
    }

    pub async fn get(&self, group_id: &str) -> Result<Option<OcoGroup>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(OcoCommand::Get {
                group_id: group_id.to_string(),
                reply,
            })
            .await?;
        Ok(rx.await?)
    }
}

pub struct OcoManager {
    book: OcoBook,
    gateway: OrderGateway,
    statuses: Subscription,
    commands: mpsc::Receiver<OcoCommand>,
}

impl OcoManager {
    pub fn new(bus: &EventBus, gateway: OrderGateway, telemetry: Telemetry) -> (Self, OcoHandle) {
        let (tx, commands) = mpsc::channel(64);
        let manager = Self {
            book: OcoBook::new(telemetry),
            gateway,
            statuses: bus.subscribe(Topic::OrderStatus),
            commands,
        };
        (manager, OcoHandle { tx })
    }

    async fn handle_command(&mut self, command: OcoCommand) {
        match command {
            OcoCommand::Submit { spec, reply } => {
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
            OcoCommand::Get { group_id, reply } => {
                let _ = reply.send(self.book.get(&group_id).cloned());
            }
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("OCO manager starting");
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
        let races = self
            .book
            .groups()
            .filter(|g| g.state == OcoState::BothFilledRace)
            .count();
        info!(races, "OCO manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderSide;
    use crate::telemetry::MemorySink;
    use rust_decimal_macros::dec;

    fn spec() -> OcoSpec {
        OcoSpec::new(
            "oco-1",
            OrderIntent::limit("AAPL", OrderSide::Sell, 10, dec!(160)),
            OrderIntent::stop("AAPL", OrderSide::Sell, 10, dec!(140)),
        )
    }

    fn status(order_id: &str, status: OrderStatus, filled: u64) -> OrderStatusEvent {
        OrderStatusEvent {
            order_id: VenueOrderId::new(order_id),
            symbol: "AAPL".to_string(),
            side: OrderSide::Sell,
            status,
            filled_qty: filled,
            remaining_qty: 0,
            avg_price: None,
            timestamp: Utc::now(),
        }
    }

    /// Place both legs as A and B
    fn working_book(telemetry: Telemetry) -> OcoBook {
        let mut book = OcoBook::new(telemetry);
        let actions = book.open(spec()).unwrap();
        assert_eq!(actions.len(), 1);
        let LegAction::Submit { key, intent } = &actions[0] else {
            panic!("expected submit");
        };
        let next = book.on_submitted(key, VenueOrderId::new("A"), intent.clone());
        assert_eq!(next.len(), 1);
        let LegAction::Submit { key, intent } = &next[0] else {
            panic!("expected second submit");
        };
        assert_eq!(key.role, LegRole::OcoSecond);
        assert!(book.on_submitted(key, VenueOrderId::new("B"), intent.clone()).is_empty());
        assert_eq!(book.get("oco-1").unwrap().state, OcoState::BothWorking);
        book
    }

    #[test]
    fn test_validation() {
        assert!(spec().validate().is_ok());
        let mismatched = OcoSpec::new(
            "oco",
            OrderIntent::limit("AAPL", OrderSide::Sell, 10, dec!(160)),
            OrderIntent::stop("MSFT", OrderSide::Sell, 10, dec!(140)),
        );
        assert!(mismatched.validate().is_err());
        let unnamed = OcoSpec::new(
            " ",
            OrderIntent::limit("AAPL", OrderSide::Sell, 10, dec!(160)),
            OrderIntent::stop("AAPL", OrderSide::Sell, 10, dec!(140)),
        );
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_fill_cancels_sibling_exactly_once() {
        let mut book = working_book(Telemetry::disabled());

        let actions = book.on_status(&status("A", OrderStatus::Filled, 10));
        assert_eq!(
            actions,
            vec![LegAction::Cancel {
                key: LegKey::new("oco-1", LegRole::OcoSecond),
                order_id: VenueOrderId::new("B"),
            }]
        );
        assert_eq!(book.get("oco-1").unwrap().state, OcoState::OneFilled);

        assert!(book.on_status(&status("A", OrderStatus::Filled, 10)).is_empty());
        assert!(book.on_status(&status("A", OrderStatus::Filled, 10)).is_empty());

        book.on_status(&status("B", OrderStatus::Cancelled, 0));
        assert_eq!(book.get("oco-1").unwrap().state, OcoState::Closed);
    }

    #[test]
    fn test_partial_fill_does_not_cancel() {
        let mut book = working_book(Telemetry::disabled());
        assert!(book.on_status(&status("B", OrderStatus::PartiallyFilled, 3)).is_empty());
        assert_eq!(book.get("oco-1").unwrap().state, OcoState::BothWorking);
    }

    #[test]
    fn test_external_cancel_closes_group() {
        let mut book = working_book(Telemetry::disabled());
        let actions = book.on_status(&status("B", OrderStatus::Expired, 0));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].key().role, LegRole::OcoFirst);
        assert_eq!(book.get("oco-1").unwrap().state, OcoState::Closed);
    }

    #[tokio::test]
    async fn test_both_filled_race_is_recorded() {
        let sink = MemorySink::new();
        let (telemetry, forwarder) = Telemetry::spawn(sink.clone(), 64);
        let mut book = working_book(telemetry);

        assert_eq!(book.on_status(&status("A", OrderStatus::Filled, 10)).len(), 1);
        assert!(book.on_status(&status("B", OrderStatus::Filled, 10)).is_empty());
        assert_eq!(book.get("oco-1").unwrap().state, OcoState::BothFilledRace);

        drop(book);
        forwarder.await.unwrap();
        assert_eq!(sink.named("oco.both_filled_race").len(), 1);
    }

    #[test]
    fn test_first_leg_failure_never_sends_second() {
        let mut book = OcoBook::new(Telemetry::disabled());
        let actions = book.open(spec()).unwrap();
        let follow_up = book.on_submit_failed(actions[0].key(), "rejected".to_string());
        assert!(follow_up.is_empty());
        let group = book.get("oco-1").unwrap();
        assert_eq!(group.state, OcoState::Closed);
        assert!(group.second.order_id.is_none());
    }

    #[test]
    fn test_second_leg_failure_cancels_first() {
        let mut book = OcoBook::new(Telemetry::disabled());
        let actions = book.open(spec()).unwrap();
        let LegAction::Submit { key, intent } = &actions[0] else {
            panic!("expected submit");
        };
        let next = book.on_submitted(key, VenueOrderId::new("A"), intent.clone());
        let cancel = book.on_submit_failed(next[0].key(), "venue down".to_string());
        assert_eq!(
            cancel,
            vec![LegAction::Cancel {
                key: LegKey::new("oco-1", LegRole::OcoFirst),
                order_id: VenueOrderId::new("A"),
            }]
        );
        assert_eq!(book.get("oco-1").unwrap().state, OcoState::Closed);
    }
}
