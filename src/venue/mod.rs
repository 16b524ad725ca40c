//! Venue and market-data interfaces

pub mod sim;
mod traits;

pub use sim::{SimOrder, SimulatedVenue, SimulatedVenueConfig};
pub use traits::{MarketDataFeed, Venue};

#[cfg(test)]
pub use traits::MockVenue;
