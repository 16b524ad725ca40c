//! Venue access for lifecycle managers and the coordinator
//!
//! Wraps the risk pipeline, the venue and a per-call timeout. A call that
//! times out may still have reached the venue, so it is reported as a
//! reconciliation item rather than treated as a clean failure.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use super::{LegAction, LegBook, LegKey};
use crate::domain::{ModifyTerms, OrderIntent, VenueOrderId};
use crate::error::{BulwarkError, Result};
use crate::portfolio::PortfolioHandle;
use crate::risk::{Decision, RejectReason, RiskPipeline};
use crate::telemetry::Telemetry;
use crate::venue::Venue;

pub const DEFAULT_VENUE_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Accepted by the venue; `intent` is what was actually sent
    Placed {
        order_id: VenueOrderId,
        intent: OrderIntent,
    },
    Rejected(RejectReason),
    Failed(BulwarkError),
}

/// Venue answer for one [`LegAction`]
#[derive(Debug)]
pub enum ActionOutcome {
    Submitted {
        key: LegKey,
        order_id: VenueOrderId,
        intent: OrderIntent,
    },
    SubmitFailed {
        key: LegKey,
        reason: String,
    },
    Cancelled {
        key: LegKey,
        order_id: VenueOrderId,
        result: Result<()>,
    },
    Modified {
        key: LegKey,
        order_id: VenueOrderId,
        terms: ModifyTerms,
        result: Result<()>,
    },
}

#[derive(Clone)]
pub struct OrderGateway {
    pipeline: Arc<RiskPipeline>,
    venue: Arc<dyn Venue>,
    portfolio: PortfolioHandle,
    timeout: Duration,
    telemetry: Telemetry,
}

impl OrderGateway {
    pub fn new(
        pipeline: Arc<RiskPipeline>,
        venue: Arc<dyn Venue>,
        portfolio: PortfolioHandle,
    ) -> Self {
        Self {
            pipeline,
            venue,
            portfolio,
            timeout: DEFAULT_VENUE_CALL_TIMEOUT,
            telemetry: Telemetry::disabled(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn pipeline(&self) -> &Arc<RiskPipeline> {
        &self.pipeline
    }

    pub fn portfolio(&self) -> &PortfolioHandle {
        &self.portfolio
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn reconciliation(&self, action: &str, context: serde_json::Value, elapsed: Duration) -> BulwarkError {
        let elapsed_ms = elapsed.as_millis() as u64;
        error!(
            venue = self.venue.name(),
            action,
            elapsed_ms,
            %context,
            "venue call timed out; reconciliation required"
        );
        self.telemetry.error(
            "lifecycle.reconciliation_required",
            serde_json::json!({
                "venue": self.venue.name(),
                "action": action,
                "elapsed_ms": elapsed_ms,
                "context": context,
            }),
        );
        BulwarkError::VenueTimeout {
            action: action.to_string(),
            elapsed_ms,
        }
    }

    /// Send an intent to the venue with no risk check
    pub async fn place(&self, intent: &OrderIntent) -> Result<VenueOrderId> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, self.venue.submit(intent)).await {
            Ok(result) => result,
            Err(_) => Err(self.reconciliation(
                "submit",
                serde_json::json!({
                    "intent_id": intent.intent_id.to_string(),
                    "idempotency_key": intent.idempotency_key,
                    "symbol": intent.symbol,
                    "side": intent.side.to_string(),
                    "quantity": intent.quantity,
                }),
                started.elapsed(),
            )),
        }
    }

    /// Resolve through the risk pipeline, then place
    pub async fn submit_checked(&self, intent: &OrderIntent) -> SubmitOutcome {
        let snapshot = self.portfolio.snapshot();
        match self.pipeline.resolve(intent, &snapshot) {
            Decision::Approve(approved) => match self.place(&approved).await {
                Ok(order_id) => SubmitOutcome::Placed {
                    order_id,
                    intent: approved,
                },
                Err(e) => SubmitOutcome::Failed(e),
            },
            Decision::Reject(reason) => SubmitOutcome::Rejected(reason),
            Decision::Clip { .. } => SubmitOutcome::Failed(BulwarkError::Internal(
                "risk pipeline returned an unresolved clip".to_string(),
            )),
        }
    }

    pub async fn cancel(&self, order_id: &VenueOrderId) -> Result<()> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, self.venue.cancel(order_id)).await {
            Ok(result) => result,
            Err(_) => Err(self.reconciliation(
                "cancel",
                serde_json::json!({ "order_id": order_id.as_str() }),
                started.elapsed(),
            )),
        }
    }

    pub async fn modify(&self, order_id: &VenueOrderId, terms: ModifyTerms) -> Result<()> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, self.venue.modify(order_id, terms)).await {
            Ok(result) => result,
            Err(_) => Err(self.reconciliation(
                "modify",
                serde_json::json!({
                    "order_id": order_id.as_str(),
                    "price": terms.price.map(|p| p.to_string()),
                    "quantity": terms.quantity,
                }),
                started.elapsed(),
            )),
        }
    }

    pub async fn execute(&self, action: LegAction) -> ActionOutcome {
        match action {
            LegAction::Submit { key, intent } => {
                let outcome = if key.is_protective() {
                    match self.place(&intent).await {
                        Ok(order_id) => SubmitOutcome::Placed { order_id, intent },
                        Err(e) => SubmitOutcome::Failed(e),
                    }
                } else {
                    self.submit_checked(&intent).await
                };
                match outcome {
                    SubmitOutcome::Placed { order_id, intent } => ActionOutcome::Submitted {
                        key,
                        order_id,
                        intent,
                    },
                    SubmitOutcome::Rejected(reason) => ActionOutcome::SubmitFailed {
                        key,
                        reason: format!("{}: {}", reason.code(), reason),
                    },
                    SubmitOutcome::Failed(e) => {
                        warn!(leg = %key, error = %e, "leg submission failed");
                        ActionOutcome::SubmitFailed {
                            key,
                            reason: e.to_string(),
                        }
                    }
                }
            }
            LegAction::Cancel { key, order_id } => {
                let result = self.cancel(&order_id).await;
                if let Err(e) = &result {
                    warn!(leg = %key, %order_id, error = %e, "leg cancel failed");
                }
                ActionOutcome::Cancelled {
                    key,
                    order_id,
                    result,
                }
            }
            LegAction::Modify {
                key,
                order_id,
                terms,
            } => {
                let result = self.modify(&order_id, terms).await;
                if let Err(e) = &result {
                    warn!(leg = %key, %order_id, error = %e, "leg modify failed");
                }
                ActionOutcome::Modified {
                    key,
                    order_id,
                    terms,
                    result,
                }
            }
        }
    }

    /// Run actions in order, feeding each result back into the book and
    /// queueing whatever follow-up work the book asks for.
    pub async fn drive<B: LegBook + ?Sized>(&self, book: &mut B, actions: Vec<LegAction>) {
        let mut queue: VecDeque<LegAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            let follow_up = match self.execute(action).await {
                ActionOutcome::Submitted {
                    key,
                    order_id,
                    intent,
                } => book.on_submitted(&key, order_id, intent),
                ActionOutcome::SubmitFailed { key, reason } => book.on_submit_failed(&key, reason),
                ActionOutcome::Cancelled {
                    key,
                    order_id,
                    result,
                } => book.on_cancel_result(&key, &order_id, &result),
                ActionOutcome::Modified {
                    key,
                    order_id,
                    terms,
                    result,
                } => book.on_modify_result(&key, &order_id, terms, &result),
            };
            queue.extend(follow_up);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LegRole, OrderSide};
    use crate::portfolio::PortfolioSnapshot;
    use crate::risk::{KillReason, KillSwitch, LiveTradingGate, SymbolLimitRegistry, SymbolLimits};
    use crate::telemetry::MemorySink;
    use crate::venue::MockVenue;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    fn gateway(venue: Arc<dyn Venue>, pipeline: RiskPipeline) -> OrderGateway {
        OrderGateway::new(
            Arc::new(pipeline),
            venue,
            PortfolioHandle::fixed(PortfolioSnapshot::empty(dec!(100000))),
        )
    }

    fn intent() -> OrderIntent {
        OrderIntent::market("AAPL", OrderSide::Buy, 10).with_expected_price(dec!(150))
    }

    #[tokio::test]
    async fn test_venue_error_becomes_failed_outcome() {
        let mut venue = MockVenue::new();
        venue.expect_name().return_const("mock".to_string());
        venue
            .expect_submit()
            .times(1)
            .returning(|_| Err(BulwarkError::VenueRejected("no liquidity".to_string())));

        let gw = gateway(Arc::new(venue), RiskPipeline::permissive());
        match gw.submit_checked(&intent()).await {
            SubmitOutcome::Failed(BulwarkError::VenueRejected(msg)) => {
                assert_eq!(msg, "no liquidity")
            }
            other => panic!("expected venue failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pipeline_reject_never_reaches_venue() {
        let mut venue = MockVenue::new();
        venue.expect_name().return_const("mock".to_string());
        venue.expect_submit().never();

        let switch = Arc::new(KillSwitch::in_memory());
        switch.engage(KillReason::Manual("halt".to_string()));
        let pipeline = RiskPipeline::new(
            Arc::new(LiveTradingGate::paper()),
            switch,
            SymbolLimitRegistry::new(SymbolLimits::default()),
        );
        let gw = gateway(Arc::new(venue), pipeline);
        assert!(matches!(
            gw.submit_checked(&intent()).await,
            SubmitOutcome::Rejected(RejectReason::KillSwitchEngaged { .. })
        ));
    }

    #[tokio::test]
    async fn test_protective_legs_skip_the_pipeline() {
        let mut venue = MockVenue::new();
        venue.expect_name().return_const("mock".to_string());
        venue
            .expect_submit()
            .times(1)
            .returning(|_| Ok(VenueOrderId::new("stop-1")));

        let switch = Arc::new(KillSwitch::in_memory());
        switch.engage(KillReason::Manual("halt".to_string()));
        let pipeline = RiskPipeline::new(
            Arc::new(LiveTradingGate::paper()),
            switch,
            SymbolLimitRegistry::new(SymbolLimits::default()),
        );
        let gw = gateway(Arc::new(venue), pipeline);
        let stop = OrderIntent::stop("AAPL", OrderSide::Sell, 10, dec!(145));
        let outcome = gw
            .execute(LegAction::Submit {
                key: LegKey::new("b1", LegRole::StopLoss),
                intent: stop,
            })
            .await;
        assert!(matches!(outcome, ActionOutcome::Submitted { .. }));
    }

    struct StalledVenue;

    #[async_trait]
    impl Venue for StalledVenue {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn submit(&self, _intent: &OrderIntent) -> Result<VenueOrderId> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(VenueOrderId::new("late"))
        }

        async fn cancel(&self, _order_id: &VenueOrderId) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        async fn modify(&self, _order_id: &VenueOrderId, _terms: ModifyTerms) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_timeout_reports_reconciliation() {
        let sink = MemorySink::new();
        let (telemetry, forwarder) = Telemetry::spawn(sink.clone(), 16);
        let gw = gateway(Arc::new(StalledVenue), RiskPipeline::permissive())
            .with_timeout(Duration::from_millis(20))
            .with_telemetry(telemetry);

        let err = gw.place(&intent()).await.unwrap_err();
        assert!(err.needs_reconciliation());
        let err = gw.cancel(&VenueOrderId::new("x")).await.unwrap_err();
        assert!(matches!(err, BulwarkError::VenueTimeout { ref action, .. } if action == "cancel"));

        drop(gw);
        forwarder.await.unwrap();
        let events = sink.named("lifecycle.reconciliation_required");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].context["action"], "submit");
    }
}
