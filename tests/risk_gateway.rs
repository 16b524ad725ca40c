use bulwark::domain::{OrderIntent, OrderSide};
use bulwark::lifecycle::{OrderGateway, SubmitOutcome};
use bulwark::portfolio::{PortfolioHandle, PortfolioSnapshot, Position};
use bulwark::risk::{
    KillReason, KillSwitch, LiveTradingGate, RiskPipeline, SymbolLimitOverride,
    SymbolLimitRegistry, SymbolLimits, TradingMode,
};
use bulwark::venue::SimulatedVenue;
use bulwark::EventBus;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn snapshot_with_loss() -> PortfolioSnapshot {
    let mut snapshot = PortfolioSnapshot::empty(dec!(100000));
    let mut x = Position::flat("X");
    x.quantity = 50;
    x.avg_cost = dec!(20);
    x.realized_pnl_today = dec!(-250);
    x.last_price = Some(dec!(20));
    snapshot.positions.insert("X".to_string(), x);
    snapshot.realized_pnl_today = dec!(-250);
    snapshot
}

fn gateway(pipeline: RiskPipeline, snapshot: PortfolioSnapshot) -> (Arc<SimulatedVenue>, OrderGateway) {
    let venue = Arc::new(SimulatedVenue::new(EventBus::new()));
    let gateway = OrderGateway::new(Arc::new(pipeline), venue.clone(), PortfolioHandle::fixed(snapshot));
    (venue, gateway)
}

#[tokio::test]
async fn symbol_daily_loss_stops_only_that_symbol() {
    let mut limits = SymbolLimitRegistry::new(SymbolLimits::default());
    limits
        .set_override(
            "X",
            SymbolLimitOverride {
                max_daily_loss: Some(dec!(200)),
                ..Default::default()
            },
        )
        .unwrap();
    let pipeline = RiskPipeline::new(
        Arc::new(LiveTradingGate::paper()),
        Arc::new(KillSwitch::in_memory()),
        limits,
    );
    let (venue, gateway) = gateway(pipeline, snapshot_with_loss());

    let more_x = OrderIntent::market("X", OrderSide::Buy, 5).with_expected_price(dec!(20));
    match gateway.submit_checked(&more_x).await {
        SubmitOutcome::Rejected(reason) => assert_eq!(reason.code(), "daily_loss_limit"),
        other => panic!("unexpected {:?}", other),
    }

    let reduce_x = OrderIntent::market("X", OrderSide::Sell, 10).with_expected_price(dec!(20));
    assert!(matches!(gateway.submit_checked(&reduce_x).await, SubmitOutcome::Placed { .. }));

    let y = OrderIntent::market("Y", OrderSide::Buy, 5).with_expected_price(dec!(40));
    assert!(matches!(gateway.submit_checked(&y).await, SubmitOutcome::Placed { .. }));

    let sent: Vec<String> = venue.submissions().iter().map(|i| i.symbol.clone()).collect();
    assert_eq!(sent, vec!["X".to_string(), "Y".to_string()]);
}

#[tokio::test]
async fn unacknowledged_live_gate_blocks_everything() {
    let gate = LiveTradingGate::new(TradingMode::Live, "");
    gate.arm();
    let pipeline = RiskPipeline::new(
        Arc::new(gate),
        Arc::new(KillSwitch::in_memory()),
        SymbolLimitRegistry::new(SymbolLimits::default()),
    );
    let (venue, gateway) = gateway(pipeline, PortfolioSnapshot::empty(dec!(100000)));

    for intent in [
        OrderIntent::market("AAPL", OrderSide::Buy, 1).with_expected_price(dec!(150)),
        OrderIntent::limit("MSFT", OrderSide::Sell, 3, dec!(300)),
    ] {
        match gateway.submit_checked(&intent).await {
            SubmitOutcome::Rejected(reason) => {
                assert_eq!(reason.code(), "live_trading_not_acknowledged")
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(venue.submissions().is_empty());
}

#[tokio::test]
async fn engaged_kill_switch_rejects_before_other_checks() {
    let kill_switch = Arc::new(KillSwitch::in_memory());
    let pipeline = RiskPipeline::new(
        Arc::new(LiveTradingGate::paper()),
        kill_switch.clone(),
        SymbolLimitRegistry::new(SymbolLimits::default()),
    );
    let (venue, gateway) = gateway(pipeline, PortfolioSnapshot::empty(dec!(100000)));
    assert!(kill_switch.engage(KillReason::Manual("drill".to_string())));

    // would otherwise fail the notional check
    let huge = OrderIntent::market("AAPL", OrderSide::Buy, 1000).with_expected_price(dec!(150));
    match gateway.submit_checked(&huge).await {
        SubmitOutcome::Rejected(reason) => assert_eq!(reason.code(), "kill_switch_engaged"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(venue.submissions().is_empty());
}
