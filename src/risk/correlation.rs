//! Correlation matrix and correlated-exposure guard

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

use super::decision::RejectReason;
use crate::domain::OrderIntent;
use crate::error::{BulwarkError, Result};
use crate::portfolio::PortfolioSnapshot;

/// Symmetric pairwise correlations keyed by upper-cased symbol
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrelationMatrix {
    values: HashMap<String, HashMap<String, Decimal>>,
}

impl CorrelationMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from nested maps, e.g. `{"AAPL": {"MSFT": 0.82}}`
    pub fn from_nested(nested: &HashMap<String, HashMap<String, Decimal>>) -> Result<Self> {
        let mut matrix = Self::new();
        for (a, row) in nested {
            matrix.register(a);
            for (b, value) in row {
                matrix.set(a, b, *value)?;
            }
        }
        Ok(matrix)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let nested: HashMap<String, HashMap<String, Decimal>> = serde_json::from_str(&raw)?;
        let matrix = Self::from_nested(&nested)?;
        info!(path = %path.display(), symbols = matrix.len(), "loaded correlation matrix");
        Ok(matrix)
    }

    /// Make a symbol known to the matrix without any correlated peers
    pub fn register(&mut self, symbol: &str) {
        let symbol = symbol.trim().to_uppercase();
        self.values.entry(symbol).or_default();
    }

    pub fn set(&mut self, a: &str, b: &str, value: Decimal) -> Result<()> {
        if value < Decimal::NEGATIVE_ONE || value > Decimal::ONE {
            return Err(BulwarkError::Validation(format!(
                "correlation {}/{} must be within [-1, 1], got {}",
                a, b, value
            )));
        }
        let a = a.trim().to_uppercase();
        let b = b.trim().to_uppercase();
        if a == b {
            self.values.entry(a).or_default();
            return Ok(());
        }
        self.values
            .entry(a.clone())
            .or_default()
            .insert(b.clone(), value);
        self.values.entry(b).or_default().insert(a, value);
        Ok(())
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.values.contains_key(&symbol.to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Correlation between two symbols; 1 on the diagonal
    pub fn get(&self, a: &str, b: &str) -> Option<Decimal> {
        let a = a.to_uppercase();
        let b = b.to_uppercase();
        if a == b {
            return Some(Decimal::ONE);
        }
        self.values.get(&a).and_then(|row| row.get(&b)).copied()
    }

    /// Peers whose absolute correlation with `symbol` exceeds `threshold`
    pub fn correlated_symbols(&self, symbol: &str, threshold: Decimal) -> Vec<String> {
        let mut peers: Vec<String> = self
            .values
            .get(&symbol.to_uppercase())
            .map(|row| {
                row.iter()
                    .filter(|(_, value)| value.abs() > threshold)
                    .map(|(peer, _)| peer.clone())
                    .collect()
            })
            .unwrap_or_default();
        peers.sort();
        peers
    }

    pub fn to_nested(&self) -> BTreeMap<String, BTreeMap<String, Decimal>> {
        self.values
            .iter()
            .map(|(k, row)| {
                (
                    k.clone(),
                    row.iter().map(|(p, v)| (p.clone(), *v)).collect(),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CorrelationGuard {
    matrix: CorrelationMatrix,
    threshold: Decimal,
    max_exposure: Decimal,
}

impl CorrelationGuard {
    pub fn new(matrix: CorrelationMatrix, threshold: Decimal, max_exposure: Decimal) -> Result<Self> {
        if threshold <= Decimal::ZERO || threshold > Decimal::ONE {
            return Err(BulwarkError::Validation(format!(
                "correlation threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if max_exposure <= Decimal::ZERO {
            return Err(BulwarkError::Validation(format!(
                "max correlated exposure must be positive, got {}",
                max_exposure
            )));
        }
        Ok(Self {
            matrix,
            threshold,
            max_exposure,
        })
    }

    pub fn matrix(&self) -> &CorrelationMatrix {
        &self.matrix
    }

    pub fn max_exposure(&self) -> Decimal {
        self.max_exposure
    }

    /// `exposure_of` turns (quantity, price) into the exposure figure used for
    /// the target symbol, so callers can fold in fee estimates.
    pub fn check<F>(
        &self,
        intent: &OrderIntent,
        price: Decimal,
        portfolio: &PortfolioSnapshot,
        exposure_of: F,
    ) -> std::result::Result<(), RejectReason>
    where
        F: Fn(u64, Decimal) -> Decimal,
    {
        let symbol = &intent.symbol;
        let current = portfolio.quantity(symbol);
        let projected = current + intent.signed_quantity();

        if projected.abs() <= current.abs() {
            debug!(%symbol, current, projected, "correlation guard: exposure-reducing order passes");
            return Ok(());
        }

        if !self.matrix.contains(symbol) {
            return Err(RejectReason::CorrelationDataMissing {
                symbol: symbol.clone(),
            });
        }

        let mut total = exposure_of(projected.unsigned_abs(), price);
        let mut contributing = Vec::new();
        for peer in self.matrix.correlated_symbols(symbol, self.threshold) {
            let Some(position) = portfolio.position(&peer) else {
                continue;
            };
            if position.is_flat() {
                continue;
            }
            total += position.market_value().abs();
            contributing.push(peer);
        }

        if total > self.max_exposure {
            return Err(RejectReason::CorrelatedExposureLimit {
                symbol: symbol.clone(),
                projected: total,
                limit: self.max_exposure,
                correlated: contributing,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ExecutionEvent;
    use crate::domain::{OrderSide, VenueOrderId};
    use crate::portfolio::PortfolioState;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn matrix() -> CorrelationMatrix {
        let mut m = CorrelationMatrix::new();
        m.set("aapl", "msft", dec!(0.85)).unwrap();
        m.set("AAPL", "XOM", dec!(0.10)).unwrap();
        m.set("AAPL", "SQQQ", dec!(-0.95)).unwrap();
        m
    }

    fn portfolio(holdings: &[(&str, i64, Decimal)]) -> PortfolioSnapshot {
        let mut state = PortfolioState::new(dec!(1000000));
        for (symbol, qty, price) in holdings {
            let side = if *qty > 0 { OrderSide::Buy } else { OrderSide::Sell };
            state
                .apply_execution(&ExecutionEvent {
                    order_id: VenueOrderId::new("seed"),
                    symbol: symbol.to_string(),
                    side,
                    fill_qty: qty.unsigned_abs(),
                    fill_price: *price,
                    commission: Decimal::ZERO,
                    timestamp: Utc::now(),
                })
                .unwrap();
        }
        state.snapshot()
    }

    fn raw(qty: u64, price: Decimal) -> Decimal {
        Decimal::from(qty) * price
    }

    #[test]
    fn test_matrix_is_symmetric_with_unit_diagonal() {
        let m = matrix();
        assert_eq!(m.get("MSFT", "AAPL"), Some(dec!(0.85)));
        assert_eq!(m.get("xom", "xom"), Some(Decimal::ONE));
        assert_eq!(m.correlated_symbols("AAPL", dec!(0.75)), vec!["MSFT", "SQQQ"]);
        assert!(m.clone().set("A", "B", dec!(1.5)).is_err());
    }

    #[test]
    fn test_rejects_when_combined_exposure_exceeds_ceiling() {
        let guard = CorrelationGuard::new(matrix(), dec!(0.75), dec!(20000)).unwrap();
        let book = portfolio(&[("MSFT", 40, dec!(300)), ("XOM", 100, dec!(100))]);

        // 10 AAPL @150 = 1500, plus MSFT 12000 -> fits
        let small = OrderIntent::market("AAPL", OrderSide::Buy, 10);
        assert!(guard.check(&small, dec!(150), &book, raw).is_ok());

        // 60 AAPL @150 = 9000 + 12000 > 20000; XOM is below the threshold
        let large = OrderIntent::market("AAPL", OrderSide::Buy, 60);
        match guard.check(&large, dec!(150), &book, raw) {
            Err(RejectReason::CorrelatedExposureLimit {
                projected,
                correlated,
                ..
            }) => {
                assert_eq!(projected, dec!(21000));
                assert_eq!(correlated, vec!["MSFT"]);
            }
            other => panic!("expected correlated exposure rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_reducing_order_always_passes() {
        let guard = CorrelationGuard::new(matrix(), dec!(0.75), dec!(1000)).unwrap();
        let book = portfolio(&[("AAPL", 100, dec!(150)), ("MSFT", 500, dec!(300))]);

        for qty in [1, 50, 100, 200] {
            let sell = OrderIntent::market("AAPL", OrderSide::Sell, qty);
            assert!(guard.check(&sell, dec!(150), &book, raw).is_ok(), "qty {}", qty);
        }
        // 201 flips to a bigger short than the current long
        let flip = OrderIntent::market("AAPL", OrderSide::Sell, 201);
        assert!(guard.check(&flip, dec!(150), &book, raw).is_err());
    }

    #[test]
    fn test_unknown_symbol_fails_closed() {
        let guard = CorrelationGuard::new(matrix(), dec!(0.75), dec!(1000000)).unwrap();
        let book = portfolio(&[]);
        let intent = OrderIntent::market("NVDA", OrderSide::Buy, 1);
        assert_eq!(
            guard.check(&intent, dec!(100), &book, raw),
            Err(RejectReason::CorrelationDataMissing {
                symbol: "NVDA".to_string()
            })
        );
    }

    #[test]
    fn test_guard_parameters_validated() {
        assert!(CorrelationGuard::new(matrix(), dec!(0), dec!(1)).is_err());
        assert!(CorrelationGuard::new(matrix(), dec!(0.5), dec!(0)).is_err());
    }
}
