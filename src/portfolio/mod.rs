//! Portfolio state: ledger plus the task that owns it

pub mod ledger;
pub mod service;

pub use ledger::{FillOutcome, PortfolioSnapshot, PortfolioState, Position};
pub use service::{PortfolioHandle, PortfolioService};
