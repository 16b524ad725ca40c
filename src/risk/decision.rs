use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::OrderIntent;

/// Outcome of running an intent through the risk pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Approve(OrderIntent),
    /// Reduced-quantity intent; must be validated again before submission
    Clip {
        intent: OrderIntent,
        reason: ClipReason,
    },
    Reject(RejectReason),
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Decision::Approve(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Decision::Reject(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::Approve(_) => "approve",
            Decision::Clip { .. } => "clip",
            Decision::Reject(_) => "reject",
        }
    }
}

/// Why a quantity was reduced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ClipReason {
    PositionLimit {
        symbol: String,
        limit: u64,
        requested: u64,
        allowed: u64,
    },
    OrderNotional {
        symbol: String,
        limit: Decimal,
        requested: u64,
        allowed: u64,
    },
}

impl ClipReason {
    pub fn code(&self) -> &'static str {
        match self {
            ClipReason::PositionLimit { .. } => "position_limit",
            ClipReason::OrderNotional { .. } => "order_notional_limit",
        }
    }
}

impl std::fmt::Display for ClipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClipReason::PositionLimit {
                symbol,
                limit,
                requested,
                allowed,
            } => write!(
                f,
                "{} position limit {}: clipped {} -> {}",
                symbol, limit, requested, allowed
            ),
            ClipReason::OrderNotional {
                symbol,
                limit,
                requested,
                allowed,
            } => write!(
                f,
                "{} order notional limit {}: clipped {} -> {}",
                symbol, limit, requested, allowed
            ),
        }
    }
}

/// Why an intent was refused. `code()` is stable and machine readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    InvalidIntent {
        detail: String,
    },
    KillSwitchEngaged {
        reason: String,
    },
    LiveTradingNotAcknowledged,
    PriceUnavailable {
        symbol: String,
    },
    DailyLossLimit {
        symbol: String,
        realized: Decimal,
        limit: Decimal,
    },
    GlobalDailyLossLimit {
        realized: Decimal,
        limit: Decimal,
    },
    PositionLimit {
        symbol: String,
        limit: u64,
        current: i64,
    },
    OrderNotionalLimit {
        symbol: String,
        limit: Decimal,
        notional: Decimal,
    },
    CorrelationDataMissing {
        symbol: String,
    },
    CorrelatedExposureLimit {
        symbol: String,
        projected: Decimal,
        limit: Decimal,
        correlated: Vec<String>,
    },
    ClipNotConverging {
        passes: u32,
    },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::InvalidIntent { .. } => "invalid_intent",
            RejectReason::KillSwitchEngaged { .. } => "kill_switch_engaged",
            RejectReason::LiveTradingNotAcknowledged => "live_trading_not_acknowledged",
            RejectReason::PriceUnavailable { .. } => "price_unavailable",
            RejectReason::DailyLossLimit { .. } => "daily_loss_limit",
            RejectReason::GlobalDailyLossLimit { .. } => "global_daily_loss_limit",
            RejectReason::PositionLimit { .. } => "position_limit",
            RejectReason::OrderNotionalLimit { .. } => "order_notional_limit",
            RejectReason::CorrelationDataMissing { .. } => "correlation_data_missing",
            RejectReason::CorrelatedExposureLimit { .. } => "correlated_exposure_limit",
            RejectReason::ClipNotConverging { .. } => "clip_not_converging",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InvalidIntent { detail } => write!(f, "Invalid intent: {}", detail),
            RejectReason::KillSwitchEngaged { reason } => {
                write!(f, "Kill switch engaged: {}", reason)
            }
            RejectReason::LiveTradingNotAcknowledged => {
                write!(f, "Live trading has not been acknowledged")
            }
            RejectReason::PriceUnavailable { symbol } => {
                write!(f, "No reference price available for {}", symbol)
            }
            RejectReason::DailyLossLimit {
                symbol,
                realized,
                limit,
            } => write!(
                f,
                "Daily loss limit for {}: realized {} <= -{}",
                symbol, realized, limit
            ),
            RejectReason::GlobalDailyLossLimit { realized, limit } => {
                write!(f, "Portfolio daily loss limit: realized {} <= -{}", realized, limit)
            }
            RejectReason::PositionLimit {
                symbol,
                limit,
                current,
            } => write!(
                f,
                "Position limit for {}: {} shares, current {}",
                symbol, limit, current
            ),
            RejectReason::OrderNotionalLimit {
                symbol,
                limit,
                notional,
            } => write!(
                f,
                "Order notional {} exceeds {} for {}",
                notional, limit, symbol
            ),
            RejectReason::CorrelationDataMissing { symbol } => {
                write!(f, "No correlation data for {}", symbol)
            }
            RejectReason::CorrelatedExposureLimit {
                symbol,
                projected,
                limit,
                correlated,
            } => write!(
                f,
                "Correlated exposure {} exceeds {} for {} (with {})",
                projected,
                limit,
                symbol,
                correlated.join(", ")
            ),
            RejectReason::ClipNotConverging { passes } => {
                write!(f, "Clipped intent did not settle after {} passes", passes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reject_reason_code_and_message() {
        let reason = RejectReason::DailyLossLimit {
            symbol: "X".to_string(),
            realized: dec!(-200),
            limit: dec!(200),
        };
        assert_eq!(reason.code(), "daily_loss_limit");
        assert_eq!(reason.to_string(), "Daily loss limit for X: realized -200 <= -200");

        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["code"], "daily_loss_limit");
    }
}
