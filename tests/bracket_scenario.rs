mod common;

use async_trait::async_trait;
use bulwark::domain::{ModifyTerms, OrderIntent, OrderSide, VenueOrderId};
use bulwark::error::{BulwarkError, Result};
use bulwark::lifecycle::{BracketManager, BracketSpec, BracketState, OrderGateway};
use bulwark::portfolio::{PortfolioHandle, PortfolioSnapshot};
use bulwark::risk::RiskPipeline;
use bulwark::telemetry::Telemetry;
use bulwark::venue::{SimulatedVenueConfig, Venue};
use bulwark::EventBus;
use common::{eventually, Harness};
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

#[tokio::test]
async fn bracket_take_profit_closes_the_trade() {
    let mut harness = Harness::with_venue_config(
        RiskPipeline::permissive(),
        SimulatedVenueConfig {
            commission_per_fill: dec!(1),
            ..Default::default()
        },
    );
    let (manager, brackets) =
        BracketManager::new(&harness.bus, harness.gateway.clone(), Telemetry::disabled());
    harness.spawn(manager.run(harness.shutdown.subscribe()));

    let entry = OrderIntent::market("AAPL", OrderSide::Buy, 10).with_expected_price(dec!(150));
    let group = brackets
        .submit(BracketSpec::new(entry, dec!(145), dec!(155)))
        .await
        .unwrap();
    let id = group.id.clone();

    harness.venue.push_tick("AAPL", dec!(150));
    assert!(
        eventually(|| async {
            matches!(
                brackets.get(&id).await,
                Ok(Some(g)) if g.state == BracketState::ExitsWorking
            )
        })
        .await
    );

    let working = harness.venue.working_orders("AAPL");
    assert_eq!(working.len(), 2);
    let stop = working
        .iter()
        .find(|o| o.stop_price == Some(dec!(145)))
        .unwrap()
        .order_id
        .clone();

    harness.venue.push_tick("AAPL", dec!(155));
    assert!(
        eventually(|| async {
            matches!(brackets.get(&id).await, Ok(Some(g)) if g.state == BracketState::Closed)
        })
        .await
    );
    assert_eq!(harness.venue.cancels(), vec![stop]);

    let mut portfolio = harness.portfolio.clone();
    let snapshot = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        portfolio.wait_for(|s| s.quantity("AAPL") == 0 && s.realized_pnl_today == dec!(50)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(snapshot.fees_today, dec!(2));
    assert_eq!(snapshot.net_realized_today(), dec!(48));

    harness.stop().await;
}

/// Refuses everything and counts the attempts
struct RefusingVenue {
    submits: AtomicUsize,
}

#[async_trait]
impl Venue for RefusingVenue {
    fn name(&self) -> &str {
        "refusing"
    }

    async fn submit(&self, intent: &OrderIntent) -> Result<VenueOrderId> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        Err(BulwarkError::VenueRejected(format!("{} not tradable", intent.symbol)))
    }

    async fn cancel(&self, order_id: &VenueOrderId) -> Result<()> {
        Err(BulwarkError::UnknownOrder(order_id.to_string()))
    }

    async fn modify(&self, order_id: &VenueOrderId, _terms: ModifyTerms) -> Result<()> {
        Err(BulwarkError::UnknownOrder(order_id.to_string()))
    }
}

#[tokio::test]
async fn rejected_entry_submits_nothing_else() {
    let bus = EventBus::new();
    let venue = Arc::new(RefusingVenue {
        submits: AtomicUsize::new(0),
    });
    let gateway = OrderGateway::new(
        Arc::new(RiskPipeline::permissive()),
        venue.clone(),
        PortfolioHandle::fixed(PortfolioSnapshot::empty(dec!(100000))),
    );
    let (manager, brackets) = BracketManager::new(&bus, gateway, Telemetry::disabled());
    let (shutdown, _) = broadcast::channel(1);
    let task = tokio::spawn(manager.run(shutdown.subscribe()));

    let entry = OrderIntent::limit("AAPL", OrderSide::Buy, 10, dec!(150));
    let group = tokio_test::assert_ok!(
        brackets
            .submit(BracketSpec::new(entry, dec!(145), dec!(155)))
            .await
    );
    assert_eq!(group.state, BracketState::EntryRejected);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(venue.submits.load(Ordering::SeqCst), 1);

    let _ = shutdown.send(());
    task.await.unwrap();
}
