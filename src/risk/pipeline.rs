//! Risk pipeline
//!
//! Pure validation over an intent and a portfolio snapshot. Stages run in a
//! fixed order and the first failure short-circuits:
//!
//! 0. structural checks and the kill switch
//! 1. live-trading gate
//! 2. per-symbol limits (daily loss, position size, order notional)
//! 3. correlated exposure
//!
//! Fee estimates, when enabled, feed the notional and exposure figures used
//! by stages 2 and 3. A clip returns a reduced intent that has to go through
//! the pipeline again; [`RiskPipeline::resolve`] does that with a bounded
//! number of passes.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use super::correlation::CorrelationGuard;
use super::decision::{ClipReason, Decision, RejectReason};
use super::fees::FeeModel;
use super::kill_switch::KillSwitch;
use super::limits::{SymbolLimitOverride, SymbolLimitRegistry, SymbolLimits};
use super::live_gate::LiveTradingGate;
use crate::domain::OrderIntent;
use crate::error::Result;
use crate::portfolio::PortfolioSnapshot;
use crate::telemetry::Telemetry;

pub const DEFAULT_MAX_CLIP_PASSES: u32 = 3;

pub struct RiskPipeline {
    gate: Arc<LiveTradingGate>,
    kill_switch: Arc<KillSwitch>,
    limits: RwLock<SymbolLimitRegistry>,
    global_max_daily_loss: Option<Decimal>,
    correlation: Option<CorrelationGuard>,
    fees: Option<FeeModel>,
    telemetry: Telemetry,
    max_clip_passes: u32,
}

impl RiskPipeline {
    pub fn new(
        gate: Arc<LiveTradingGate>,
        kill_switch: Arc<KillSwitch>,
        limits: SymbolLimitRegistry,
    ) -> Self {
        Self {
            gate,
            kill_switch,
            limits: RwLock::new(limits),
            global_max_daily_loss: None,
            correlation: None,
            fees: None,
            telemetry: Telemetry::disabled(),
            max_clip_passes: DEFAULT_MAX_CLIP_PASSES,
        }
    }

    /// Paper-mode pipeline with default limits; used by tests and tooling
    pub fn permissive() -> Self {
        Self::new(
            Arc::new(LiveTradingGate::paper()),
            Arc::new(KillSwitch::in_memory()),
            SymbolLimitRegistry::new(SymbolLimits::default()),
        )
    }

    pub fn with_global_daily_loss(mut self, limit: Decimal) -> Self {
        self.global_max_daily_loss = Some(limit);
        self
    }

    pub fn with_correlation(mut self, guard: CorrelationGuard) -> Self {
        self.correlation = Some(guard);
        self
    }

    pub fn with_fees(mut self, fees: FeeModel) -> Self {
        self.fees = Some(fees);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_max_clip_passes(mut self, passes: u32) -> Self {
        self.max_clip_passes = passes.max(1);
        self
    }

    pub fn gate(&self) -> &Arc<LiveTradingGate> {
        &self.gate
    }

    pub fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.kill_switch
    }

    pub fn effective_limits(&self, symbol: &str) -> SymbolLimits {
        match self.limits.read() {
            Ok(registry) => registry.effective(symbol),
            Err(poisoned) => poisoned.into_inner().effective(symbol),
        }
    }

    /// Tighten a symbol at runtime. Looser overrides are refused.
    pub fn set_symbol_override(&self, symbol: &str, limits: SymbolLimitOverride) -> Result<()> {
        let mut registry = match self.limits.write() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.set_override(symbol, limits)
    }

    pub fn limits_snapshot(&self) -> SymbolLimitRegistry {
        match self.limits.read() {
            Ok(registry) => registry.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Run every stage once
    pub fn validate(&self, intent: &OrderIntent, portfolio: &PortfolioSnapshot) -> Decision {
        let decision = self.evaluate(intent, portfolio);
        match &decision {
            Decision::Approve(_) => {
                debug!(symbol = %intent.symbol, qty = intent.quantity, "risk approved");
            }
            Decision::Clip { intent: clipped, reason } => {
                debug!(symbol = %intent.symbol, %reason, "risk clipped");
                self.telemetry.info(
                    "risk.clipped",
                    serde_json::json!({
                        "intent_id": intent.intent_id.to_string(),
                        "symbol": intent.symbol,
                        "side": intent.side.to_string(),
                        "requested": intent.quantity,
                        "allowed": clipped.quantity,
                        "code": reason.code(),
                        "reason": reason.to_string(),
                    }),
                );
            }
            Decision::Reject(reason) => {
                warn!(
                    symbol = %intent.symbol,
                    side = %intent.side,
                    qty = intent.quantity,
                    code = reason.code(),
                    %reason,
                    "risk rejected intent"
                );
                self.telemetry.warning(
                    "risk.rejected",
                    serde_json::json!({
                        "intent_id": intent.intent_id.to_string(),
                        "symbol": intent.symbol,
                        "side": intent.side.to_string(),
                        "quantity": intent.quantity,
                        "code": reason.code(),
                        "reason": reason.to_string(),
                    }),
                );
            }
        }
        decision
    }

    /// Validate, re-running clipped intents until they settle. The result is
    /// never a `Clip`: an `Approve` may carry a reduced quantity.
    pub fn resolve(&self, intent: &OrderIntent, portfolio: &PortfolioSnapshot) -> Decision {
        let mut current = intent.clone();
        for _ in 0..self.max_clip_passes {
            match self.validate(&current, portfolio) {
                Decision::Clip { intent: next, .. } => current = next,
                settled => return settled,
            }
        }
        let reason = RejectReason::ClipNotConverging {
            passes: self.max_clip_passes,
        };
        self.telemetry.warning(
            "risk.rejected",
            serde_json::json!({
                "intent_id": intent.intent_id.to_string(),
                "symbol": intent.symbol,
                "code": reason.code(),
                "reason": reason.to_string(),
            }),
        );
        Decision::Reject(reason)
    }

    fn evaluate(&self, intent: &OrderIntent, portfolio: &PortfolioSnapshot) -> Decision {
        // stage 0
        if let Err(e) = intent.validate() {
            return Decision::Reject(RejectReason::InvalidIntent {
                detail: e.to_string(),
            });
        }
        if self.kill_switch.is_engaged() {
            return Decision::Reject(RejectReason::KillSwitchEngaged {
                reason: self.kill_switch.reason_text(),
            });
        }

        // stage 1
        if let Err(reason) = self.gate.check() {
            return Decision::Reject(reason);
        }

        // stage 2
        let limits = self.effective_limits(&intent.symbol);
        let current = portfolio.quantity(&intent.symbol);
        let projected = current.saturating_add(intent.signed_quantity());
        let increases_exposure = projected.abs() > current.abs();

        if increases_exposure {
            if let Err(reason) = self.check_daily_loss(intent, portfolio, &limits) {
                return Decision::Reject(reason);
            }

            if projected.unsigned_abs() > limits.max_position_size {
                let headroom = i64::try_from(limits.max_position_size)
                    .unwrap_or(i64::MAX)
                    .saturating_sub(intent.side.sign().saturating_mul(current));
                let allowed = headroom.max(0) as u64;
                if allowed == 0 {
                    return Decision::Reject(RejectReason::PositionLimit {
                        symbol: intent.symbol.clone(),
                        limit: limits.max_position_size,
                        current,
                    });
                }
                let allowed = allowed.min(intent.quantity);
                return Decision::Clip {
                    intent: intent.with_quantity(allowed),
                    reason: ClipReason::PositionLimit {
                        symbol: intent.symbol.clone(),
                        limit: limits.max_position_size,
                        requested: intent.quantity,
                        allowed,
                    },
                };
            }
        }

        let Some(price) = intent
            .reference_price()
            .or_else(|| portfolio.mark(&intent.symbol))
        else {
            return Decision::Reject(RejectReason::PriceUnavailable {
                symbol: intent.symbol.clone(),
            });
        };

        let notional = self.exposure(&intent.symbol, intent.quantity, price);
        if notional > limits.max_order_notional {
            let allowed = self.max_quantity_within(&intent.symbol, limits.max_order_notional, price);
            if allowed == 0 {
                return Decision::Reject(RejectReason::OrderNotionalLimit {
                    symbol: intent.symbol.clone(),
                    limit: limits.max_order_notional,
                    notional,
                });
            }
            let allowed = allowed.min(intent.quantity);
            return Decision::Clip {
                intent: intent.with_quantity(allowed),
                reason: ClipReason::OrderNotional {
                    symbol: intent.symbol.clone(),
                    limit: limits.max_order_notional,
                    requested: intent.quantity,
                    allowed,
                },
            };
        }

        // stage 3
        if let Some(guard) = &self.correlation {
            let exposure_of = |qty: u64, px: Decimal| self.exposure(&intent.symbol, qty, px);
            if let Err(reason) = guard.check(intent, price, portfolio, exposure_of) {
                return Decision::Reject(reason);
            }
        }

        Decision::Approve(intent.clone())
    }

    fn check_daily_loss(
        &self,
        intent: &OrderIntent,
        portfolio: &PortfolioSnapshot,
        limits: &SymbolLimits,
    ) -> std::result::Result<(), RejectReason> {
        // figures from an earlier day no longer count against today
        if portfolio.is_stale_day(Utc::now().date_naive()) {
            debug!(
                symbol = %intent.symbol,
                trading_day = %portfolio.trading_day,
                "daily loss skipped for a previous trading day"
            );
            return Ok(());
        }

        let symbol_net = portfolio
            .position(&intent.symbol)
            .map(|p| p.net_realized_today())
            .unwrap_or_default();
        if symbol_net <= -limits.max_daily_loss {
            return Err(RejectReason::DailyLossLimit {
                symbol: intent.symbol.clone(),
                realized: symbol_net,
                limit: limits.max_daily_loss,
            });
        }

        if let Some(limit) = self.global_max_daily_loss {
            let total = portfolio.net_realized_today();
            if total <= -limit {
                return Err(RejectReason::GlobalDailyLossLimit {
                    realized: total,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Notional, plus estimated costs when fee estimates are enabled
    fn exposure(&self, symbol: &str, quantity: u64, price: Decimal) -> Decimal {
        match &self.fees {
            Some(fees) => fees.adjusted_notional(symbol, quantity, price),
            None => Decimal::from(quantity) * price,
        }
    }

    fn max_quantity_within(&self, symbol: &str, ceiling: Decimal, price: Decimal) -> u64 {
        match &self.fees {
            Some(fees) => fees.max_quantity_within(symbol, ceiling, price),
            None if price > Decimal::ZERO => (ceiling / price).floor().to_u64().unwrap_or(0),
            None => 0,
        }
    }
}
