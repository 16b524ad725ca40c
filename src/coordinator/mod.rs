//! Strategy coordination
//!
//! Runs a graph of strategies over shared market data. Every intent goes
//! through a single chokepoint that applies the capital policy's envelope
//! before the risk pipeline sees it.

pub mod coordinator;
pub mod graph;
pub mod policy;
pub mod sma;
pub mod strategy;

pub use coordinator::{
    CoordinatorHandle, CoordinatorSettings, StrategyCoordinator, DEFAULT_INTENT_QUEUE_CAPACITY,
};
pub use graph::{
    CapitalPolicyConfig, CapitalPolicyKind, GraphRuntimeSettings, StrategyGraphConfig,
    StrategyNodeConfig,
};
pub use policy::{policy_from_config, CapitalPolicy, EqualWeightPolicy, FixedWeightPolicy, PositionEnvelope};
pub use sma::SmaCrossover;
pub use strategy::{
    IntentOutcome, Strategy, StrategyBuilder, StrategyContext, StrategyFactory, StrategyState,
};
