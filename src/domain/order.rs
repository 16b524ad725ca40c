use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BulwarkError, Result};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> i64 {
        match self {
            OrderSide::Buy => 1,
            OrderSide::Sell => -1,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderKind {
    pub fn needs_limit_price(&self) -> bool {
        matches!(self, OrderKind::Limit | OrderKind::StopLimit)
    }

    pub fn needs_stop_price(&self) -> bool {
        matches!(self, OrderKind::Stop | OrderKind::StopLimit)
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
            OrderKind::Stop => "STOP",
            OrderKind::StopLimit => "STOP_LIMIT",
        };
        write!(f, "{}", s)
    }
}

/// Order status as reported by the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created locally, not yet acknowledged
    PendingSubmit,
    /// Acknowledged and working at the venue
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::PendingSubmit | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }

    /// Whether the venue has seen and accepted the order
    pub fn is_acknowledged(&self) -> bool {
        matches!(
            self,
            OrderStatus::Submitted | OrderStatus::PartiallyFilled | OrderStatus::Filled
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::PendingSubmit => "PENDING_SUBMIT",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// Identifier assigned by the venue on submission
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VenueOrderId(pub String);

impl VenueOrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VenueOrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role an order plays inside a multi-leg group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    Entry,
    StopLoss,
    TakeProfit,
    OcoFirst,
    OcoSecond,
    TrailingStop,
}

impl std::fmt::Display for LegRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LegRole::Entry => "entry",
            LegRole::StopLoss => "stop_loss",
            LegRole::TakeProfit => "take_profit",
            LegRole::OcoFirst => "oco_first",
            LegRole::OcoSecond => "oco_second",
            LegRole::TrailingStop => "trailing_stop",
        };
        write!(f, "{}", s)
    }
}

/// Link from an intent to the group that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLink {
    pub group_id: String,
    pub role: LegRole,
}

/// Replacement terms for a working order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModifyTerms {
    pub price: Option<Decimal>,
    pub quantity: Option<u64>,
}

impl ModifyTerms {
    pub fn price(price: Decimal) -> Self {
        Self {
            price: Some(price),
            quantity: None,
        }
    }

    pub fn quantity(quantity: u64) -> Self {
        Self {
            price: None,
            quantity: Some(quantity),
        }
    }
}

/// Unsubmitted order request.
///
/// Intents are values: adjusting one (a clip, a re-link) yields a new intent
/// and leaves the original untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub intent_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub kind: OrderKind,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// Price the submitter expects to trade at (used for sizing market orders)
    pub expected_price: Option<Decimal>,
    pub group: Option<GroupLink>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    fn base(symbol: &str, side: OrderSide, quantity: u64, kind: OrderKind) -> Self {
        let intent_id = Uuid::new_v4();
        Self {
            intent_id,
            symbol: symbol.trim().to_uppercase(),
            side,
            quantity,
            kind,
            limit_price: None,
            stop_price: None,
            expected_price: None,
            group: None,
            idempotency_key: intent_id.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn market(symbol: &str, side: OrderSide, quantity: u64) -> Self {
        Self::base(symbol, side, quantity, OrderKind::Market)
    }

    pub fn limit(symbol: &str, side: OrderSide, quantity: u64, price: Decimal) -> Self {
        let mut intent = Self::base(symbol, side, quantity, OrderKind::Limit);
        intent.limit_price = Some(price);
        intent
    }

    pub fn stop(symbol: &str, side: OrderSide, quantity: u64, stop_price: Decimal) -> Self {
        let mut intent = Self::base(symbol, side, quantity, OrderKind::Stop);
        intent.stop_price = Some(stop_price);
        intent
    }

    pub fn stop_limit(
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        stop_price: Decimal,
        limit_price: Decimal,
    ) -> Self {
        let mut intent = Self::base(symbol, side, quantity, OrderKind::StopLimit);
        intent.stop_price = Some(stop_price);
        intent.limit_price = Some(limit_price);
        intent
    }

    pub fn with_expected_price(mut self, price: Decimal) -> Self {
        self.expected_price = Some(price);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>, role: LegRole) -> Self {
        self.group = Some(GroupLink {
            group_id: group_id.into(),
            role,
        });
        self
    }

    /// Derived intent with a different quantity; identity and key are kept
    /// so duplicate detection still applies to the clipped order.
    pub fn with_quantity(&self, quantity: u64) -> Self {
        let mut next = self.clone();
        next.quantity = quantity;
        next
    }

    /// Price used for sizing: expected, then limit, then stop
    pub fn reference_price(&self) -> Option<Decimal> {
        self.expected_price.or(self.limit_price).or(self.stop_price)
    }

    /// Signed quantity this order adds to a position
    pub fn signed_quantity(&self) -> i64 {
        self.side.sign() * i64::try_from(self.quantity).unwrap_or(i64::MAX)
    }

    pub fn notional(&self, price: Decimal) -> Decimal {
        price * Decimal::from(self.quantity)
    }

    /// Structural checks that do not depend on portfolio state
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(BulwarkError::Validation("symbol is empty".to_string()));
        }
        if self.quantity == 0 {
            return Err(BulwarkError::Validation("quantity must be positive".to_string()));
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(BulwarkError::Validation(
                "idempotency key is empty".to_string(),
            ));
        }
        if self.kind.needs_limit_price() && self.limit_price.is_none() {
            return Err(BulwarkError::Validation(format!(
                "{} order requires a limit price",
                self.kind
            )));
        }
        if self.kind.needs_stop_price() && self.stop_price.is_none() {
            return Err(BulwarkError::Validation(format!(
                "{} order requires a stop price",
                self.kind
            )));
        }
        for (name, price) in [
            ("limit_price", self.limit_price),
            ("stop_price", self.stop_price),
            ("expected_price", self.expected_price),
        ] {
            if let Some(price) = price {
                if price <= Decimal::ZERO {
                    return Err(BulwarkError::Validation(format!(
                        "{} must be positive, got {}",
                        name, price
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The platform's view of one venue order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub intent: OrderIntent,
    pub order_id: Option<VenueOrderId>,
    pub status: OrderStatus,
    pub filled_qty: u64,
    pub avg_fill_price: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn new(intent: OrderIntent) -> Self {
        Self {
            intent,
            order_id: None,
            status: OrderStatus::PendingSubmit,
            filled_qty: 0,
            avg_fill_price: None,
            updated_at: Utc::now(),
        }
    }

    pub fn mark_submitted(&mut self, order_id: VenueOrderId) {
        self.order_id = Some(order_id);
        self.updated_at = Utc::now();
    }

    /// Force a local terminal status (e.g. the submit call failed)
    pub fn mark_terminal(&mut self, status: OrderStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Apply a venue status report. Returns false when the report was
    /// ignored because the record is already terminal.
    pub fn apply_status(
        &mut self,
        status: OrderStatus,
        filled_qty: u64,
        avg_price: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.filled_qty = self.filled_qty.max(filled_qty);
        if avg_price.is_some() {
            self.avg_fill_price = avg_price;
        }
        self.updated_at = at;
        true
    }

    pub fn remaining_qty(&self) -> u64 {
        self.intent.quantity.saturating_sub(self.filled_qty)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn symbol(&self) -> &str {
        &self.intent.symbol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reference_price_prefers_expected() {
        let intent = OrderIntent::limit("aapl", OrderSide::Buy, 10, dec!(150))
            .with_expected_price(dec!(149.5));
        assert_eq!(intent.symbol, "AAPL");
        assert_eq!(intent.reference_price(), Some(dec!(149.5)));

        let stop = OrderIntent::stop("AAPL", OrderSide::Sell, 10, dec!(145));
        assert_eq!(stop.reference_price(), Some(dec!(145)));
        assert_eq!(OrderIntent::market("AAPL", OrderSide::Buy, 1).reference_price(), None);
    }

    #[test]
    fn test_with_quantity_keeps_identity() {
        let intent = OrderIntent::market("MSFT", OrderSide::Sell, 20).with_idempotency_key("k-1");
        let clipped = intent.with_quantity(5);
        assert_eq!(clipped.quantity, 5);
        assert_eq!(intent.quantity, 20);
        assert_eq!(clipped.intent_id, intent.intent_id);
        assert_eq!(clipped.idempotency_key, "k-1");
        assert_eq!(clipped.signed_quantity(), -5);
    }

    #[test]
    fn test_validate_rejects_missing_prices() {
        let mut intent = OrderIntent::market("AAPL", OrderSide::Buy, 1);
        intent.kind = OrderKind::StopLimit;
        assert!(intent.validate().is_err());

        let zero = OrderIntent::market("AAPL", OrderSide::Buy, 0);
        assert!(zero.validate().is_err());

        let negative = OrderIntent::limit("AAPL", OrderSide::Buy, 1, dec!(-1));
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_record_ignores_updates_after_terminal() {
        let mut record = OrderRecord::new(OrderIntent::market("AAPL", OrderSide::Buy, 10));
        record.mark_submitted(VenueOrderId::new("7"));
        assert!(record.apply_status(OrderStatus::Filled, 10, Some(dec!(150)), Utc::now()));
        assert!(!record.apply_status(OrderStatus::Submitted, 0, None, Utc::now()));
        assert_eq!(record.status, OrderStatus::Filled);
        assert_eq!(record.remaining_qty(), 0);
    }
}
