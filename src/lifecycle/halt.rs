//! Cancels working venue orders when the kill switch engages
//!
//! Tracks every non-terminal order seen on the order-status topic. When an
//! engage notice arrives on the account topic and the switch has order
//! cancellation enabled, each tracked order is cancelled through the
//! gateway. Cancels that fail are reported, not retried.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::gateway::OrderGateway;
use crate::bus::{AccountEvent, BusEvent, EventBus, OrderStatusEvent, Subscription, Topic};
use crate::domain::VenueOrderId;
use crate::risk::KillSwitch;
use crate::telemetry::Telemetry;

pub struct HaltEnforcer {
    gateway: OrderGateway,
    kill_switch: Arc<KillSwitch>,
    statuses: Subscription,
    account: Subscription,
    working: BTreeMap<VenueOrderId, String>,
    telemetry: Telemetry,
}

impl HaltEnforcer {
    pub fn new(
        bus: &EventBus,
        gateway: OrderGateway,
        kill_switch: Arc<KillSwitch>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            gateway,
            kill_switch,
            statuses: bus.subscribe(Topic::OrderStatus),
            account: bus.subscribe(Topic::Account),
            working: BTreeMap::new(),
            telemetry,
        }
    }

    fn track(&mut self, event: &OrderStatusEvent) {
        if event.status.is_terminal() {
            self.working.remove(&event.order_id);
        } else {
            self.working
                .insert(event.order_id.clone(), event.symbol.clone());
        }
    }

    /// Orders currently believed to be working
    pub fn working_orders(&self) -> Vec<VenueOrderId> {
        self.working.keys().cloned().collect()
    }

    async fn cancel_all(&mut self, reason: &str) {
        // statuses and the engage notice travel on different topics
        while let Some(event) = self.statuses.try_recv() {
            if let BusEvent::OrderStatus(status) = event {
                self.track(&status);
            }
        }
        if !self.kill_switch.cancel_orders_enabled() {
            info!(open = self.working.len(), "kill switch engaged; order cancellation disabled");
            return;
        }

        let targets: Vec<(VenueOrderId, String)> = std::mem::take(&mut self.working).into_iter().collect();
        let mut cancelled = 0usize;
        let mut failed = Vec::new();
        for (order_id, symbol) in targets {
            match self.gateway.cancel(&order_id).await {
                Ok(()) => cancelled += 1,
                Err(e) => {
                    warn!(%order_id, %symbol, error = %e, "kill switch cancel failed");
                    failed.push(order_id.to_string());
                }
            }
        }

        if failed.is_empty() {
            info!(cancelled, %reason, "working orders cancelled after kill switch");
        } else {
            error!(cancelled, failed = failed.len(), %reason, "some working orders could not be cancelled");
        }
        self.telemetry.warning(
            "safety.orders_cancelled",
            serde_json::json!({
                "reason": reason,
                "cancelled": cancelled,
                "failed": failed,
            }),
        );
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("halt enforcer starting");
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                Some(event) = self.account.recv() => {
                    if let BusEvent::Account(AccountEvent::KillSwitch { engaged: true, reason }) = event {
                        self.cancel_all(&reason).await;
                    }
                }

                Some(event) = self.statuses.recv() => {
                    if let BusEvent::OrderStatus(status) = event {
                        self.track(&status);
                    }
                }

                else => break,
            }
        }
        info!(open = self.working.len(), "halt enforcer stopped");
    }
}
