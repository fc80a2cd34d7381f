// End-to-end: the runner trading a paper market until shutdown

mod common;

use std::time::Duration;

use common::{test_grid_config, Harness};
use mexc_grid_bot::core::GridEvent;
use mexc_grid_bot::db::SnapshotStore;
use mexc_grid_bot::{GridRunner, RunnerOptions};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn fast_options(cancel_on_shutdown: bool) -> RunnerOptions {
    RunnerOptions {
        reconcile_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(1),
        fill_queue_depth: 16,
        cancel_on_shutdown,
    }
}

#[tokio::test]
async fn test_runner_trades_round_trip_and_persists_on_shutdown() {
    let Harness {
        engine,
        paper,
        store,
        events,
    } = Harness::new(test_grid_config(), dec!(101.5));

    let market = paper.clone();
    let moves = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        market.set_price(dec!(100));
        tokio::time::sleep(Duration::from_millis(250)).await;
        market.set_price(dec!(102));
    });

    let status = GridRunner::new(engine, fast_options(false))
        .run(tokio::time::sleep(Duration::from_millis(900)))
        .await
        .expect("runner finished");
    moves.await.unwrap();

    assert_eq!(status.realized_pnl, dec!(2));
    assert_eq!(status.position, Decimal::ZERO);
    assert_eq!(status.fill_count, 2);
    assert_eq!(status.open_orders, 10);
    assert!(!status.halted);

    // Orders stay on the book; the flushed snapshot matches the final state
    assert_eq!(paper.live_orders().len(), 10);
    let snapshot = store.load("test-grid").unwrap().expect("snapshot saved");
    assert_eq!(snapshot.ledger.revision(), status.revision);
    assert_eq!(snapshot.ledger.realized_pnl(), dec!(2));

    assert_eq!(events.count(|e| matches!(e, GridEvent::ShutdownStarted)), 1);
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, GridEvent::ShutdownComplete { realized_pnl, .. } if *realized_pnl == dec!(2))));
}

#[tokio::test]
async fn test_runner_cancels_orders_when_asked() {
    let Harness { engine, paper, .. } = Harness::new(test_grid_config(), dec!(101.5));

    let status = GridRunner::new(engine, fast_options(true))
        .run(tokio::time::sleep(Duration::from_millis(200)))
        .await
        .expect("runner finished");

    assert!(paper.live_orders().is_empty());
    assert_eq!(status.open_orders, 0);
}

#[tokio::test]
async fn test_fill_during_shutdown_cancel_is_kept() {
    let Harness { engine, paper, store, .. } = Harness::new(test_grid_config(), dec!(101.5));

    // The buy at 100 executes as the shutdown begins, before its cancel goes out
    let market = paper.clone();
    let shutdown = async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        market.set_price(dec!(100));
    };

    let status = GridRunner::new(engine, fast_options(true))
        .run(shutdown)
        .await
        .expect("runner finished");

    assert_eq!(status.position, dec!(1));
    assert!(paper.live_orders().is_empty());
    let snapshot = store.load("test-grid").unwrap().expect("snapshot saved");
    assert_eq!(snapshot.ledger.position(), dec!(1));
    assert_eq!(snapshot.ledger.revision(), status.revision);
}
