//! Capital allocation policies
//!
//! A policy turns the graph into one envelope per (strategy, symbol). The
//! coordinator clips every intent to its envelope before risk validation.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use super::graph::{CapitalPolicyConfig, CapitalPolicyKind, StrategyGraphConfig};
use crate::error::{BulwarkError, Result};

/// Size bounds for one strategy on one symbol; `None` means unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PositionEnvelope {
    pub max_position: Option<u64>,
    pub max_notional: Option<Decimal>,
}

pub trait CapitalPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn prepare(&mut self, graph: &StrategyGraphConfig) -> Result<()>;

    /// `None` when the strategy is not allocated to the symbol
    fn envelope_for(&self, strategy_id: &str, symbol: &str) -> Option<PositionEnvelope>;
}

type EnvelopeTable = HashMap<(String, String), PositionEnvelope>;

fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Envelope = node limits. With a per-symbol budget, the strategies sharing
/// a symbol split it equally and the envelope takes the smaller bound.
#[derive(Debug, Default)]
pub struct EqualWeightPolicy {
    per_symbol_budget: Option<u64>,
    envelopes: EnvelopeTable,
}

impl EqualWeightPolicy {
    pub fn new(per_symbol_budget: Option<u64>) -> Self {
        Self {
            per_symbol_budget,
            envelopes: HashMap::new(),
        }
    }
}

impl CapitalPolicy for EqualWeightPolicy {
    fn name(&self) -> &str {
        "equal_weight"
    }

    fn prepare(&mut self, graph: &StrategyGraphConfig) -> Result<()> {
        let mut sharing: BTreeMap<&str, u64> = BTreeMap::new();
        for node in &graph.strategies {
            for symbol in &node.symbols {
                *sharing.entry(symbol.as_str()).or_default() += 1;
            }
        }

        let mut envelopes = HashMap::new();
        for node in &graph.strategies {
            for symbol in &node.symbols {
                let share = self.per_symbol_budget.map(|budget| {
                    let count = sharing.get(symbol.as_str()).copied().unwrap_or(1).max(1);
                    budget / count
                });
                envelopes.insert(
                    (node.id.clone(), symbol.clone()),
                    PositionEnvelope {
                        max_position: min_opt(node.max_position, share),
                        max_notional: node.max_notional,
                    },
                );
            }
        }
        self.envelopes = envelopes;
        Ok(())
    }

    fn envelope_for(&self, strategy_id: &str, symbol: &str) -> Option<PositionEnvelope> {
        self.envelopes
            .get(&(strategy_id.to_string(), symbol.to_string()))
            .copied()
    }
}

/// `max_notional = min(node.max_notional, weight * capital)`
#[derive(Debug)]
pub struct FixedWeightPolicy {
    weights: BTreeMap<String, Decimal>,
    capital: Decimal,
    envelopes: EnvelopeTable,
}

impl FixedWeightPolicy {
    pub fn new(weights: BTreeMap<String, Decimal>, capital: Decimal) -> Self {
        Self {
            weights,
            capital,
            envelopes: HashMap::new(),
        }
    }
}

impl CapitalPolicy for FixedWeightPolicy {
    fn name(&self) -> &str {
        "fixed"
    }

    fn prepare(&mut self, graph: &StrategyGraphConfig) -> Result<()> {
        let mut envelopes = HashMap::new();
        for node in &graph.strategies {
            let weight = self.weights.get(&node.id).copied().ok_or_else(|| {
                BulwarkError::CapitalAllocation(format!("no weight for strategy '{}'", node.id))
            })?;
            let budget = weight * self.capital;
            for symbol in &node.symbols {
                envelopes.insert(
                    (node.id.clone(), symbol.clone()),
                    PositionEnvelope {
                        max_position: node.max_position,
                        max_notional: min_opt(node.max_notional, Some(budget)),
                    },
                );
            }
        }
        self.envelopes = envelopes;
        Ok(())
    }

    fn envelope_for(&self, strategy_id: &str, symbol: &str) -> Option<PositionEnvelope> {
        self.envelopes
            .get(&(strategy_id.to_string(), symbol.to_string()))
            .copied()
    }
}

pub fn policy_from_config(config: &CapitalPolicyConfig) -> Result<Box<dyn CapitalPolicy>> {
    match config.kind {
        CapitalPolicyKind::EqualWeight => {
            Ok(Box::new(EqualWeightPolicy::new(config.per_symbol_position_budget)))
        }
        CapitalPolicyKind::Fixed => {
            let weights = config.weights.clone().ok_or_else(|| {
                BulwarkError::CapitalAllocation("fixed policy without weights".to_string())
            })?;
            let capital = config.capital.ok_or_else(|| {
                BulwarkError::CapitalAllocation("fixed policy without capital".to_string())
            })?;
            Ok(Box::new(FixedWeightPolicy::new(weights, capital)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::graph::StrategyNodeConfig;
    use rust_decimal_macros::dec;

    fn graph() -> StrategyGraphConfig {
        StrategyGraphConfig::new(vec![
            StrategyNodeConfig::new("a", "sma", &["AAPL", "MSFT"]).with_max_position(8),
            StrategyNodeConfig::new("b", "sma", &["AAPL"]).with_max_notional(dec!(20000)),
        ])
    }

    #[test]
    fn test_equal_weight_uses_node_limits() {
        let mut policy = EqualWeightPolicy::new(None);
        policy.prepare(&graph()).unwrap();
        assert_eq!(
            policy.envelope_for("a", "AAPL"),
            Some(PositionEnvelope {
                max_position: Some(8),
                max_notional: None
            })
        );
        assert_eq!(
            policy.envelope_for("b", "AAPL").unwrap().max_notional,
            Some(dec!(20000))
        );
        assert!(policy.envelope_for("b", "MSFT").is_none());
    }

    #[test]
    fn test_equal_weight_splits_symbol_budget() {
        let mut policy = EqualWeightPolicy::new(Some(10));
        policy.prepare(&graph()).unwrap();
        assert_eq!(policy.envelope_for("a", "AAPL").unwrap().max_position, Some(5));
        assert_eq!(policy.envelope_for("b", "AAPL").unwrap().max_position, Some(5));
        // only `a` trades MSFT, node limit is tighter than the budget
        assert_eq!(policy.envelope_for("a", "MSFT").unwrap().max_position, Some(8));
    }

    #[test]
    fn test_fixed_weight_notional() {
        let mut weights = BTreeMap::new();
        weights.insert("a".to_string(), dec!(0.5));
        weights.insert("b".to_string(), dec!(0.1));
        let mut policy = FixedWeightPolicy::new(weights, dec!(100000));
        policy.prepare(&graph()).unwrap();
        assert_eq!(policy.envelope_for("a", "AAPL").unwrap().max_notional, Some(dec!(50000)));
        assert_eq!(policy.envelope_for("b", "AAPL").unwrap().max_notional, Some(dec!(10000)));
    }

    #[test]
    fn test_fixed_weight_missing_strategy() {
        let mut weights = BTreeMap::new();
        weights.insert("a".to_string(), dec!(0.5));
        let mut policy = FixedWeightPolicy::new(weights, dec!(100000));
        assert!(matches!(
            policy.prepare(&graph()),
            Err(BulwarkError::CapitalAllocation(_))
        ));
    }
}
