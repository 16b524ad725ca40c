mod common;

use bulwark::bus::OrderStatusEvent;
use bulwark::domain::{OrderIntent, OrderSide, OrderStatus};
use bulwark::lifecycle::{OcoManager, OcoSpec, OcoState};
use bulwark::risk::RiskPipeline;
use bulwark::telemetry::{MemorySink, Telemetry};
use chrono::Utc;
use common::{eventually, Harness};
use rust_decimal_macros::dec;
use std::time::Duration;

#[tokio::test]
async fn filled_leg_cancels_sibling_exactly_once() {
    let mut harness = Harness::new(RiskPipeline::permissive());
    let sink = MemorySink::new();
    let (telemetry, telemetry_task) = Telemetry::spawn(sink.clone(), 64);
    let (manager, ocos) = OcoManager::new(&harness.bus, harness.gateway.clone(), telemetry);
    harness.spawn(manager.run(harness.shutdown.subscribe()));

    let group = ocos
        .submit(OcoSpec::new(
            "exit-aapl",
            OrderIntent::limit("AAPL", OrderSide::Sell, 10, dec!(155)),
            OrderIntent::stop("AAPL", OrderSide::Sell, 10, dec!(145)),
        ))
        .await
        .unwrap();
    assert_eq!(group.state, OcoState::BothWorking);
    let first_id = group.first.order_id.clone().unwrap();
    let second_id = group.second.order_id.clone().unwrap();

    harness.venue.push_tick("AAPL", dec!(155));
    assert!(
        eventually(|| async {
            matches!(ocos.get("exit-aapl").await, Ok(Some(g)) if g.state == OcoState::Closed)
        })
        .await
    );
    assert_eq!(harness.venue.cancels(), vec![second_id]);

    // a replayed fill report must not produce a second cancel
    harness.bus.publish(OrderStatusEvent {
        order_id: first_id,
        symbol: "AAPL".to_string(),
        side: OrderSide::Sell,
        status: OrderStatus::Filled,
        filled_qty: 10,
        remaining_qty: 0,
        avg_price: Some(dec!(155)),
        timestamp: Utc::now(),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.venue.cancels().len(), 1);
    assert!(harness.venue.working_orders("AAPL").is_empty());

    harness.stop().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), telemetry_task).await;
    assert!(sink.named("oco.both_filled_race").is_empty());
    assert!(!sink.named("oco.transition").is_empty());
}
