//! Risk and safety pipeline
//!
//! Every order intent passes through [`RiskPipeline`] before it can reach a
//! venue. The pipeline is synchronous and side-effect free apart from logs
//! and telemetry; callers hand it a portfolio snapshot.

pub mod correlation;
pub mod decision;
pub mod fees;
pub mod kill_switch;
pub mod limits;
pub mod live_gate;
pub mod pipeline;

pub use correlation::{CorrelationGuard, CorrelationMatrix};
pub use decision::{ClipReason, Decision, RejectReason};
pub use fees::{AssetClass, CommissionProfile, FeeConfig, FeeEstimate, FeeModel, SlippageEstimate};
pub use kill_switch::{KillReason, KillSwitch, KillSwitchState};
pub use limits::{SymbolLimitOverride, SymbolLimitRegistry, SymbolLimits};
pub use live_gate::{LiveTradingGate, TradingMode, DEFAULT_ACKNOWLEDGEMENT_PHRASE};
pub use pipeline::{RiskPipeline, DEFAULT_MAX_CLIP_PASSES};
