//! Portfolio service task
//!
//! Sole mutator of the ledger. Consumes execution and market-data events,
//! publishes read-only snapshots through a watch channel and as account
//! events on the bus, and checkpoints on a cadence and at shutdown.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use super::ledger::{PortfolioSnapshot, PortfolioState};
use crate::bus::{AccountEvent, BusEvent, EventBus, Subscription, Topic};
use crate::error::Result;
use crate::persistence::CheckpointService;

/// Read side of the portfolio. Cheap to clone.
#[derive(Clone)]
pub struct PortfolioHandle {
    rx: watch::Receiver<Arc<PortfolioSnapshot>>,
}

impl PortfolioHandle {
    /// Handle over a fixed snapshot, for callers that run without a service
    pub fn fixed(snapshot: PortfolioSnapshot) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(snapshot));
        Self { rx }
    }

    pub fn snapshot(&self) -> Arc<PortfolioSnapshot> {
        self.rx.borrow().clone()
    }

    /// Wait until a snapshot satisfies `predicate`, or the service stops
    pub async fn wait_for<F>(&mut self, predicate: F) -> Option<Arc<PortfolioSnapshot>>
    where
        F: FnMut(&Arc<PortfolioSnapshot>) -> bool,
    {
        self.rx.wait_for(predicate).await.ok().map(|s| s.clone())
    }
}

pub struct PortfolioService {
    state: PortfolioState,
    bus: EventBus,
    executions: Subscription,
    market_data: Subscription,
    snapshot_tx: watch::Sender<Arc<PortfolioSnapshot>>,
    checkpoints: Option<CheckpointService>,
    checkpoint_interval: Duration,
}

impl PortfolioService {
    /// Build the service around an existing ledger. Subscriptions are taken
    /// here, so no fill published after this call is missed.
    pub fn new(
        bus: &EventBus,
        state: PortfolioState,
        checkpoints: Option<CheckpointService>,
        checkpoint_interval: Duration,
    ) -> (Self, PortfolioHandle) {
        let (snapshot_tx, rx) = watch::channel(Arc::new(state.snapshot()));
        let service = Self {
            state,
            bus: bus.clone(),
            executions: bus.subscribe(Topic::Execution),
            market_data: bus.subscribe(Topic::MarketData),
            snapshot_tx,
            checkpoints,
            checkpoint_interval,
        };
        (service, PortfolioHandle { rx })
    }

    /// Load the last checkpoint if there is one, otherwise start empty
    pub async fn restore_or_new(
        bus: &EventBus,
        checkpoints: CheckpointService,
        starting_cash: Decimal,
        checkpoint_interval: Duration,
    ) -> Result<(Self, PortfolioHandle)> {
        let mut state = PortfolioState::new(starting_cash);
        if checkpoints.restore_checkpoint(&mut state).await? {
            state.roll_day(Utc::now());
            info!(
                positions = state.data().open_positions().count(),
                cash = %state.data().cash,
                trading_day = %state.data().trading_day,
                "portfolio restored from checkpoint"
            );
        } else {
            info!(cash = %starting_cash, "starting with an empty portfolio");
        }
        Ok(Self::new(bus, state, Some(checkpoints), checkpoint_interval))
    }

    fn publish_snapshot(&self, to_bus: bool) {
        let snapshot = self.state.snapshot();
        if to_bus {
            self.bus
                .publish(AccountEvent::Snapshot(snapshot.clone()));
        }
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }

    async fn checkpoint(&mut self) {
        let Some(checkpoints) = &self.checkpoints else {
            return;
        };
        match checkpoints.create_checkpoint(&self.state).await {
            Ok(()) => self.state.mark_checkpointed(),
            Err(e) => error!(error = %e, "portfolio checkpoint failed"),
        }
    }

    fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Execution(exec) => match self.state.apply_execution(&exec) {
                Ok(outcome) => {
                    info!(
                        symbol = %exec.symbol,
                        order_id = %exec.order_id,
                        side = %exec.side,
                        qty = exec.fill_qty,
                        price = %exec.fill_price,
                        position = outcome.position_after,
                        realized = %outcome.realized,
                        "fill applied to portfolio"
                    );
                    self.publish_snapshot(true);
                }
                Err(e) => warn!(order_id = %exec.order_id, error = %e, "execution ignored"),
            },
            BusEvent::MarketData(tick) => {
                if self.state.mark(&tick.symbol, tick.price, tick.timestamp) {
                    self.publish_snapshot(false);
                }
            }
            _ => {}
        }
    }

    /// Main loop. Returns after shutdown with a final checkpoint written.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("portfolio service starting");
        let mut checkpoint_tick = tokio::time::interval(self.checkpoint_interval);
        checkpoint_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("portfolio service: shutdown signal received");
                    break;
                }

                Some(event) = self.executions.recv() => self.handle_event(event),

                Some(event) = self.market_data.recv() => self.handle_event(event),

                _ = checkpoint_tick.tick() => {
                    if self.state.roll_day(Utc::now()) {
                        self.publish_snapshot(true);
                        self.checkpoint().await;
                    } else if self.state.fills_since_checkpoint() > 0 {
                        self.checkpoint().await;
                    }
                }

                else => break,
            }
        }

        // book anything already queued before the final write
        while let Some(event) = self.executions.try_recv() {
            self.handle_event(event);
        }
        self.checkpoint().await;
        info!("portfolio service stopped");
    }
}
