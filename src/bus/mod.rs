//! In-process event bus and the events it carries

#[allow(clippy::module_inception)]
mod bus;
pub mod event;

pub use bus::{BusStats, EventBus, Subscription};
pub use event::*;
