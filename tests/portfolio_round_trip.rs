use bulwark::bus::ExecutionEvent;
use bulwark::domain::{OrderSide, VenueOrderId};
use bulwark::persistence::{CheckpointService, JsonFileStore};
use bulwark::portfolio::PortfolioState;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn fill(order: &str, symbol: &str, side: OrderSide, qty: u64, price: Decimal) -> ExecutionEvent {
    ExecutionEvent {
        order_id: VenueOrderId::new(order),
        symbol: symbol.to_string(),
        side,
        fill_qty: qty,
        fill_price: price,
        commission: dec!(1),
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn ledger_survives_a_restart() {
    let dir = std::env::temp_dir().join(format!("bulwark-ledger-{}", uuid::Uuid::new_v4()));
    let checkpoints = CheckpointService::new(Arc::new(JsonFileStore::new(&dir)));

    let mut state = PortfolioState::new(dec!(100000));
    for exec in [
        fill("1", "AAPL", OrderSide::Buy, 10, dec!(150)),
        fill("2", "AAPL", OrderSide::Sell, 4, dec!(155)),
        fill("3", "MSFT", OrderSide::Sell, 5, dec!(300)),
    ] {
        state.apply_execution(&exec).unwrap();
    }
    let before = state.snapshot();
    assert_eq!(before.quantity("AAPL"), 6);
    assert_eq!(before.quantity("MSFT"), -5);
    assert_eq!(before.realized_pnl_today, dec!(20));
    assert_eq!(before.fees_today, dec!(3));

    checkpoints.create_checkpoint(&state).await.unwrap();

    let mut restored = PortfolioState::new(dec!(1));
    assert!(checkpoints.restore_checkpoint(&mut restored).await.unwrap());
    assert_eq!(restored.snapshot(), before);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn missing_checkpoint_leaves_fresh_state() {
    let dir = std::env::temp_dir().join(format!("bulwark-empty-{}", uuid::Uuid::new_v4()));
    let checkpoints = CheckpointService::new(Arc::new(JsonFileStore::new(&dir)));

    let mut state = PortfolioState::new(dec!(5000));
    assert!(!checkpoints.restore_checkpoint(&mut state).await.unwrap());
    assert_eq!(state.snapshot().cash, dec!(5000));
    assert!(state.snapshot().positions.is_empty());
}
