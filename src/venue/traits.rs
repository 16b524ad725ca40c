use async_trait::async_trait;

use crate::domain::{ModifyTerms, OrderIntent, VenueOrderId};
use crate::error::Result;

/// Execution venue.
///
/// Calls return once the venue has accepted or refused the request. Status
/// changes and fills arrive later as order-status and execution events on
/// the bus; a returned id only means the order exists at the venue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Venue: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, intent: &OrderIntent) -> Result<VenueOrderId>;

    async fn cancel(&self, order_id: &VenueOrderId) -> Result<()>;

    async fn modify(&self, order_id: &VenueOrderId, terms: ModifyTerms) -> Result<()>;
}

/// Market-data subscriptions. Ticks flow on the market-data topic.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    async fn subscribe(&self, symbol: &str) -> Result<()>;

    async fn unsubscribe(&self, symbol: &str) -> Result<()>;
}
