//! Strategy capability and factory
//!
//! Strategies never see the venue. They receive market data for their
//! symbols and hand intents to the coordinator through a
//! [`StrategyContext`], which returns the outcome of each one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::coordinator::CoordinatorHandle;
use super::graph::StrategyNodeConfig;
use crate::bus::MarketDataEvent;
use crate::domain::{OrderIntent, VenueOrderId};
use crate::error::{BulwarkError, Result};
use crate::portfolio::PortfolioHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyState {
    Registered,
    Started,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl StrategyState {
    pub fn is_live(&self) -> bool {
        matches!(self, StrategyState::Started | StrategyState::Running)
    }
}

impl std::fmt::Display for StrategyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StrategyState::Registered => "registered",
            StrategyState::Started => "started",
            StrategyState::Running => "running",
            StrategyState::Stopping => "stopping",
            StrategyState::Stopped => "stopped",
            StrategyState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What happened to one intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IntentOutcome {
    Submitted { order_id: VenueOrderId, quantity: u64 },
    Rejected { code: String, reason: String },
    /// Nothing to send, e.g. the envelope is already full
    Skipped { reason: String },
}

impl IntentOutcome {
    pub fn rejected(code: &str, reason: impl Into<String>) -> Self {
        IntentOutcome::Rejected {
            code: code.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_submitted(&self) -> bool {
        matches!(self, IntentOutcome::Submitted { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            IntentOutcome::Submitted { .. } => "submitted",
            IntentOutcome::Rejected { .. } => "rejected",
            IntentOutcome::Skipped { .. } => "skipped",
        }
    }

    pub fn submitted_quantity(&self) -> u64 {
        match self {
            IntentOutcome::Submitted { quantity, .. } => *quantity,
            _ => 0,
        }
    }
}

/// Everything a running strategy may touch
#[derive(Clone)]
pub struct StrategyContext {
    strategy_id: String,
    symbols: Arc<BTreeSet<String>>,
    coordinator: CoordinatorHandle,
    portfolio: PortfolioHandle,
}

impl StrategyContext {
    pub(crate) fn new(
        strategy_id: String,
        symbols: BTreeSet<String>,
        coordinator: CoordinatorHandle,
        portfolio: PortfolioHandle,
    ) -> Self {
        Self {
            strategy_id,
            symbols: Arc::new(symbols),
            coordinator,
            portfolio,
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn symbols(&self) -> &BTreeSet<String> {
        &self.symbols
    }

    pub fn trades(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    /// Account-level signed position
    pub fn position(&self, symbol: &str) -> i64 {
        self.portfolio.snapshot().quantity(symbol)
    }

    pub async fn submit(&self, intent: OrderIntent) -> Result<IntentOutcome> {
        self.coordinator.submit_order(intent, &self.strategy_id).await
    }
}

#[async_trait]
pub trait Strategy: Send + 'static {
    async fn on_start(&mut self, _ctx: &StrategyContext) -> Result<()> {
        Ok(())
    }

    async fn on_market_data(&mut self, event: &MarketDataEvent, ctx: &StrategyContext) -> Result<()>;

    async fn on_stop(&mut self, _ctx: &StrategyContext) -> Result<()> {
        Ok(())
    }
}

pub type StrategyBuilder =
    Arc<dyn Fn(&StrategyNodeConfig) -> Result<Box<dyn Strategy>> + Send + Sync>;

/// Builds strategies from graph nodes by `type`
#[derive(Clone, Default)]
pub struct StrategyFactory {
    builders: HashMap<String, StrategyBuilder>,
}

impl StrategyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the built-in strategies registered
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register("sma", |node| {
            Ok(Box::new(super::sma::SmaCrossover::from_node(node)?) as Box<dyn Strategy>)
        });
        factory
    }

    pub fn register<F>(&mut self, kind: &str, builder: F)
    where
        F: Fn(&StrategyNodeConfig) -> Result<Box<dyn Strategy>> + Send + Sync + 'static,
    {
        self.builders.insert(kind.to_string(), Arc::new(builder));
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    pub fn build(&self, node: &StrategyNodeConfig) -> Result<Box<dyn Strategy>> {
        let builder = self.builders.get(&node.kind).ok_or_else(|| {
            BulwarkError::StrategyInitialization(format!(
                "unsupported strategy type '{}' for '{}'",
                node.kind, node.id
            ))
        })?;
        builder(node).map_err(|e| match e {
            BulwarkError::StrategyInitialization(_) => e,
            other => BulwarkError::StrategyInitialization(format!("'{}': {}", node.id, other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    #[async_trait]
    impl Strategy for Idle {
        async fn on_market_data(&mut self, _event: &MarketDataEvent, _ctx: &StrategyContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_factory_dispatches_by_type() {
        let mut factory = StrategyFactory::with_defaults();
        factory.register("idle", |_| Ok(Box::new(Idle) as Box<dyn Strategy>));
        assert!(factory.supports("sma"));
        assert!(factory.supports("idle"));

        let node = StrategyNodeConfig::new("x", "idle", &["AAPL"]);
        assert!(factory.build(&node).is_ok());

        let unknown = StrategyNodeConfig::new("y", "martingale", &["AAPL"]);
        assert!(matches!(
            factory.build(&unknown),
            Err(BulwarkError::StrategyInitialization(_))
        ));
    }

    #[test]
    fn test_builder_errors_become_initialization_errors() {
        let mut factory = StrategyFactory::new();
        factory.register("broken", |_| Err(BulwarkError::Validation("bad params".to_string())));
        let node = StrategyNodeConfig::new("z", "broken", &["AAPL"]);
        match factory.build(&node) {
            Err(BulwarkError::StrategyInitialization(msg)) => assert!(msg.contains("bad params")),
            _ => panic!("expected initialization error"),
        }
    }
}
