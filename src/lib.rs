pub mod bus;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod persistence;
pub mod portfolio;
pub mod risk;
pub mod telemetry;
pub mod venue;

pub use bus::{BusEvent, EventBus, Subscription, Topic};
pub use config::AppConfig;
pub use coordinator::{
    CoordinatorHandle, IntentOutcome, Strategy, StrategyContext, StrategyCoordinator,
    StrategyFactory, StrategyGraphConfig,
};
pub use domain::{OrderIntent, OrderKind, OrderRecord, OrderSide, OrderStatus, VenueOrderId};
pub use error::{BulwarkError, Result};
pub use lifecycle::{BracketManager, OcoManager, OrderGateway, TrailingStopManager};
pub use persistence::{CheckpointService, Checkpointable, JsonFileStore, MemoryStore};
pub use portfolio::{PortfolioHandle, PortfolioService, PortfolioSnapshot, PortfolioState};
pub use risk::{Decision, KillSwitch, LiveTradingGate, RejectReason, RiskPipeline};
pub use telemetry::Telemetry;
pub use venue::{MarketDataFeed, SimulatedVenue, Venue};
