//! Portfolio ledger
//!
//! Positions, cash and daily P&L derived purely from execution events.
//! Realized P&L is gross of commissions: every closing fill adds exactly
//! `(fill price - average cost) * closed quantity`, with the closed quantity
//! negative when covering a short. Commissions accumulate separately and are
//! charged to cash.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::bus::ExecutionEvent;
use crate::error::{BulwarkError, Result};
use crate::persistence::Checkpointable;

/// Holding in one symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed share count, negative when short
    pub quantity: i64,
    pub avg_cost: Decimal,
    pub realized_pnl_today: Decimal,
    pub fees_today: Decimal,
    pub last_price: Option<Decimal>,
}

impl Position {
    pub fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity: 0,
            avg_cost: Decimal::ZERO,
            realized_pnl_today: Decimal::ZERO,
            fees_today: Decimal::ZERO,
            last_price: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0
    }

    /// Price used for valuation: last mark, else average cost
    pub fn valuation_price(&self) -> Decimal {
        self.last_price.unwrap_or(self.avg_cost)
    }

    /// Signed market value
    pub fn market_value(&self) -> Decimal {
        Decimal::from(self.quantity) * self.valuation_price()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        match self.last_price {
            Some(mark) => (mark - self.avg_cost) * Decimal::from(self.quantity),
            None => Decimal::ZERO,
        }
    }

    /// Realized P&L net of today's commissions
    pub fn net_realized_today(&self) -> Decimal {
        self.realized_pnl_today - self.fees_today
    }
}

/// Read-only portfolio view and the persisted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub positions: BTreeMap<String, Position>,
    pub cash: Decimal,
    pub realized_pnl_today: Decimal,
    pub fees_today: Decimal,
    pub trading_day: NaiveDate,
    pub as_of: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn empty(cash: Decimal) -> Self {
        let now = Utc::now();
        Self {
            positions: BTreeMap::new(),
            cash,
            realized_pnl_today: Decimal::ZERO,
            fees_today: Decimal::ZERO,
            trading_day: now.date_naive(),
            as_of: now,
        }
    }

    /// True when the snapshot still carries figures from before `today`
    pub fn is_stale_day(&self, today: NaiveDate) -> bool {
        self.trading_day < today
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn quantity(&self, symbol: &str) -> i64 {
        self.positions.get(symbol).map(|p| p.quantity).unwrap_or(0)
    }

    pub fn mark(&self, symbol: &str) -> Option<Decimal> {
        self.positions.get(symbol).and_then(|p| p.last_price)
    }

    pub fn net_realized_today(&self) -> Decimal {
        self.realized_pnl_today - self.fees_today
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(Position::unrealized_pnl).sum()
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| !p.is_flat())
    }
}

/// Effect of one fill on the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
    /// Shares closed, signed by the direction of the position that was closed
    pub closed_qty: i64,
    pub realized: Decimal,
    pub position_after: i64,
}

/// Mutable ledger. Owned by the portfolio service task only.
#[derive(Debug, Clone)]
pub struct PortfolioState {
    data: PortfolioSnapshot,
    realized_since_checkpoint: Decimal,
    fills_since_checkpoint: u64,
    version: i64,
}

impl PortfolioState {
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            data: PortfolioSnapshot::empty(starting_cash),
            realized_since_checkpoint: Decimal::ZERO,
            fills_since_checkpoint: 0,
            version: 0,
        }
    }

    pub fn from_snapshot(snapshot: PortfolioSnapshot) -> Self {
        Self {
            data: snapshot,
            realized_since_checkpoint: Decimal::ZERO,
            fills_since_checkpoint: 0,
            version: 0,
        }
    }

    pub fn snapshot(&self) -> PortfolioSnapshot {
        self.data.clone()
    }

    pub fn data(&self) -> &PortfolioSnapshot {
        &self.data
    }

    /// Realized P&L booked since the last persisted checkpoint
    pub fn realized_since_checkpoint(&self) -> Decimal {
        self.realized_since_checkpoint
    }

    pub fn fills_since_checkpoint(&self) -> u64 {
        self.fills_since_checkpoint
    }

    /// Called once a checkpoint has been durably written
    pub fn mark_checkpointed(&mut self) {
        self.realized_since_checkpoint = Decimal::ZERO;
        self.fills_since_checkpoint = 0;
    }

    /// Start a new trading day when `at` falls on a later UTC date. Returns
    /// true when the daily figures were reset.
    pub fn roll_day(&mut self, at: DateTime<Utc>) -> bool {
        let day = at.date_naive();
        if day <= self.data.trading_day {
            return false;
        }
        info!(
            previous = %self.data.trading_day,
            next = %day,
            realized = %self.data.realized_pnl_today,
            "portfolio trading day rolled over"
        );
        self.data.trading_day = day;
        self.data.realized_pnl_today = Decimal::ZERO;
        self.data.fees_today = Decimal::ZERO;
        for position in self.data.positions.values_mut() {
            position.realized_pnl_today = Decimal::ZERO;
            position.fees_today = Decimal::ZERO;
        }
        true
    }

    /// Book a fill
    pub fn apply_execution(&mut self, exec: &ExecutionEvent) -> Result<FillOutcome> {
        if exec.fill_qty == 0 {
            return Err(BulwarkError::Validation(format!(
                "execution {} has zero quantity",
                exec.order_id
            )));
        }
        if exec.fill_price <= Decimal::ZERO {
            return Err(BulwarkError::Validation(format!(
                "execution {} has non-positive price {}",
                exec.order_id, exec.fill_price
            )));
        }

        self.roll_day(exec.timestamp);

        let delta = exec.side.sign() * exec.fill_qty as i64;
        let price = exec.fill_price;
        let position = self
            .data
            .positions
            .entry(exec.symbol.clone())
            .or_insert_with(|| Position::flat(&exec.symbol));

        let current = position.quantity;
        let mut closed_qty: i64 = 0;
        let mut realized = Decimal::ZERO;

        if current == 0 || current.signum() == delta.signum() {
            // opening or adding
            let held = Decimal::from(current.abs());
            let added = Decimal::from(delta.abs());
            position.avg_cost = (held * position.avg_cost + added * price) / (held + added);
            position.quantity = current + delta;
        } else {
            let closing = current.abs().min(delta.abs());
            closed_qty = closing * current.signum();
            realized = (price - position.avg_cost) * Decimal::from(closed_qty);
            position.quantity = current + delta;

            if position.quantity == 0 {
                position.avg_cost = Decimal::ZERO;
            } else if position.quantity.signum() != current.signum() {
                // flipped through zero: the remainder opens at the fill price
                position.avg_cost = price;
            }
        }

        position.realized_pnl_today += realized;
        position.fees_today += exec.commission;
        position.last_price = Some(price);
        let position_after = position.quantity;

        self.data.cash -= Decimal::from(delta) * price;
        self.data.cash -= exec.commission;
        self.data.realized_pnl_today += realized;
        self.data.fees_today += exec.commission;
        self.data.as_of = exec.timestamp;
        self.realized_since_checkpoint += realized;
        self.fills_since_checkpoint += 1;
        self.version += 1;

        debug!(
            symbol = %exec.symbol,
            side = %exec.side,
            qty = exec.fill_qty,
            %price,
            position = position_after,
            %realized,
            "execution booked"
        );

        Ok(FillOutcome {
            closed_qty,
            realized,
            position_after,
        })
    }

    /// Update the mark for a symbol we already track
    pub fn mark(&mut self, symbol: &str, price: Decimal, at: DateTime<Utc>) -> bool {
        self.roll_day(at);
        match self.data.positions.get_mut(symbol) {
            Some(position) => {
                position.last_price = Some(price);
                self.data.as_of = self.data.as_of.max(at);
                true
            }
            None => false,
        }
    }
}

impl Checkpointable for PortfolioState {
    fn checkpoint_type(&self) -> &str {
        "portfolio"
    }

    fn component_name(&self) -> &str {
        "ledger"
    }

    fn to_checkpoint(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.data)?)
    }

    fn from_checkpoint(&mut self, data: &serde_json::Value) -> Result<()> {
        self.data = serde_json::from_value(data.clone())?;
        self.realized_since_checkpoint = Decimal::ZERO;
        self.fills_since_checkpoint = 0;
        Ok(())
    }

    fn version(&self) -> i64 {
        self.version
    }
}
