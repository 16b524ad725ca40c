//! Order-lifecycle managers
//!
//! Each multi-leg construct is split in two:
//!
//! - a pure book (arena of groups keyed by group id, plus an index from
//!   venue order id to `(group, leg role)`) that turns venue events into
//!   [`LegAction`]s and never performs I/O;
//! - a manager task that owns the book, subscribes to the bus, runs the
//!   actions through the [`OrderGateway`] and feeds the venue's answers
//!   back into the book.

pub mod bracket;
pub mod gateway;
pub mod halt;
pub mod oco;
pub mod trailing;

use serde::{Deserialize, Serialize};

use crate::domain::{LegRole, ModifyTerms, OrderIntent, VenueOrderId};
use crate::error::BulwarkError;
use crate::telemetry::Telemetry;

pub use bracket::{BracketBook, BracketGroup, BracketHandle, BracketManager, BracketSpec, BracketState};
pub use gateway::{ActionOutcome, OrderGateway, SubmitOutcome};
pub use halt::HaltEnforcer;
pub use oco::{OcoBook, OcoGroup, OcoHandle, OcoManager, OcoSpec, OcoState};
pub use trailing::{
    Trail, TrailingState, TrailingStop, TrailingStopBook, TrailingStopHandle,
    TrailingStopManager, TrailingStopSpec,
};

/// One leg of one group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LegKey {
    pub group_id: String,
    pub role: LegRole,
}

impl LegKey {
    pub fn new(group_id: impl Into<String>, role: LegRole) -> Self {
        Self {
            group_id: group_id.into(),
            role,
        }
    }

    /// Entries, OCO legs and trailing-stop creation pass the risk pipeline;
    /// bracket exits protect an existing fill and go straight to the venue.
    pub fn is_protective(&self) -> bool {
        matches!(self.role, LegRole::StopLoss | LegRole::TakeProfit)
    }
}

impl std::fmt::Display for LegKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group_id, self.role)
    }
}

/// Venue work requested by a book
#[derive(Debug, Clone, PartialEq)]
pub enum LegAction {
    Submit {
        key: LegKey,
        intent: OrderIntent,
    },
    Cancel {
        key: LegKey,
        order_id: VenueOrderId,
    },
    Modify {
        key: LegKey,
        order_id: VenueOrderId,
        terms: ModifyTerms,
    },
}

impl LegAction {
    pub fn key(&self) -> &LegKey {
        match self {
            LegAction::Submit { key, .. }
            | LegAction::Cancel { key, .. }
            | LegAction::Modify { key, .. } => key,
        }
    }
}

/// Book side of the manager loop: venue results come back through these
pub trait LegBook {
    fn on_submitted(
        &mut self,
        key: &LegKey,
        order_id: VenueOrderId,
        sent: OrderIntent,
    ) -> Vec<LegAction>;

    fn on_submit_failed(&mut self, key: &LegKey, reason: String) -> Vec<LegAction>;

    fn on_cancel_result(
        &mut self,
        key: &LegKey,
        order_id: &VenueOrderId,
        result: &Result<(), BulwarkError>,
    ) -> Vec<LegAction>;

    fn on_modify_result(
        &mut self,
        key: &LegKey,
        order_id: &VenueOrderId,
        terms: ModifyTerms,
        result: &Result<(), BulwarkError>,
    ) -> Vec<LegAction>;
}

/// Shared `{kind}.transition` event
pub(crate) fn emit_transition(
    telemetry: &Telemetry,
    kind: &str,
    group_id: &str,
    symbol: &str,
    from: impl std::fmt::Debug,
    to: impl std::fmt::Debug,
) {
    tracing::info!(kind, group_id, symbol, from = ?from, to = ?to, "lifecycle transition");
    telemetry.info(
        &format!("{}.transition", kind),
        serde_json::json!({
            "group_id": group_id,
            "symbol": symbol,
            "from": format!("{:?}", from),
            "to": format!("{:?}", to),
        }),
    );
}

/// Shrink a quantity by the fraction `numerator / denominator`, rounding down
pub(crate) fn scale_quantity(quantity: u64, numerator: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        return 0;
    }
    ((quantity as u128 * numerator as u128) / denominator as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_quantity_floors() {
        assert_eq!(scale_quantity(10, 4, 10), 4);
        assert_eq!(scale_quantity(7, 1, 3), 2);
        assert_eq!(scale_quantity(7, 0, 3), 0);
        assert_eq!(scale_quantity(7, 3, 0), 0);
    }

    #[test]
    fn test_protective_roles() {
        assert!(LegKey::new("g", LegRole::StopLoss).is_protective());
        assert!(!LegKey::new("g", LegRole::Entry).is_protective());
        assert!(!LegKey::new("g", LegRole::TrailingStop).is_protective());
    }
}
