// Integration tests for the grid strategy engine against the paper exchange

mod common;

use common::{test_grid_config, Harness};
use mexc_grid_bot::clients::PaperOp;
use mexc_grid_bot::core::{FillEvent, FillOutcome, GridEvent, LevelState, OrderSide, RiskGate};
use mexc_grid_bot::db::SnapshotStore;
use mexc_grid_bot::TradingError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_buy_fill_at_100_places_sell_at_102_and_back() {
    // 101.5 puts the gap on 102: buys from 90 to 100, sells from 104 up
    let mut h = Harness::new(test_grid_config(), dec!(101.5));
    let report = h.engine.sync_orders(dec!(101.5)).await.unwrap();
    assert_eq!(report.placed, 10);
    assert_eq!(h.level_state(5), (LevelState::Open, Some(OrderSide::Buy)));
    assert_eq!(h.level_state(6).0, LevelState::Empty);

    h.paper.set_price(dec!(100));
    let outcomes = h.pump_fills().await.unwrap();
    assert!(matches!(
        outcomes.as_slice(),
        [FillOutcome::Completed { index: 5, side: OrderSide::Buy, replacement: Some(6), .. }]
    ));

    // Exactly one sell at 102 owes the buy at 100
    assert_eq!(h.level_state(6), (LevelState::Open, Some(OrderSide::Sell)));
    assert_eq!(h.price_of(6), dec!(102));
    assert_eq!(h.engine.ledger().level(6).unwrap().entry_price, Some(dec!(100)));
    assert_eq!(h.level_state(5).0, LevelState::Empty);
    assert_eq!(h.engine.ledger().position(), dec!(1));
    let sells_at_102 = h
        .paper
        .live_orders()
        .iter()
        .filter(|o| o.side == OrderSide::Sell && o.price == dec!(102))
        .count();
    assert_eq!(sells_at_102, 1);

    h.paper.set_price(dec!(102));
    let outcomes = h.pump_fills().await.unwrap();
    assert!(matches!(
        outcomes.as_slice(),
        [FillOutcome::Completed { index: 6, side: OrderSide::Sell, replacement: Some(5), .. }]
    ));
    assert_eq!(h.level_state(5), (LevelState::Open, Some(OrderSide::Buy)));
    assert_eq!(h.price_of(5), dec!(100));
    assert_eq!(h.engine.ledger().position(), Decimal::ZERO);
    assert_eq!(h.engine.ledger().realized_pnl(), dec!(2));
}

#[tokio::test]
async fn test_replayed_fill_changes_ledger_once() {
    let mut h = Harness::new(test_grid_config(), dec!(101.5));
    h.engine.sync_orders(dec!(101.5)).await.unwrap();
    let order_id = h.order_id(4);

    h.paper.fill_order(&order_id, dec!(0.5)).unwrap();
    let fills = h.engine.gateway().poll_fills().await.unwrap();
    assert_eq!(fills.len(), 1);
    let fill: FillEvent = fills[0].clone();

    let first = h.engine.on_fill(fill.clone()).await.unwrap();
    let revision = h.engine.ledger().revision();
    let second = h.engine.on_fill(fill).await.unwrap();

    assert!(matches!(first, FillOutcome::Partial { index: 4, .. }));
    assert_eq!(second, FillOutcome::Duplicate);
    assert_eq!(h.engine.ledger().revision(), revision);
    assert_eq!(h.engine.ledger().position(), dec!(0.5));
    assert_eq!(h.events.count(|e| matches!(e, GridEvent::DuplicateFill { .. })), 1);
}

#[tokio::test]
async fn test_open_orders_never_exceed_level_budget() {
    let config = test_grid_config().with_max_open_orders(4);
    let mut h = Harness::new(config, dec!(101.5));

    for price in [dec!(101.5), dec!(99), dec!(103), dec!(95), dec!(107), dec!(101)] {
        h.paper.set_price(price);
        h.pump_fills().await.unwrap();
        h.engine.sync_orders(price).await.unwrap();
        assert!(h.engine.ledger().live_order_count() <= 4);
        assert!(h.paper.live_orders().len() <= 4);
    }
}

#[tokio::test]
async fn test_unknown_fill_is_reported() {
    let mut h = Harness::new(test_grid_config(), dec!(100));
    let fill = FillEvent::new("not-ours", dec!(1), dec!(100), chrono::Utc::now());

    let err = h.engine.on_fill(fill).await.unwrap_err();
    assert!(matches!(err, TradingError::UnknownOrder(_)));
    assert_eq!(h.events.count(|e| matches!(e, GridEvent::UnknownFill { .. })), 1);
}

#[tokio::test]
async fn test_exposure_cap_counts_resting_buys() {
    let config = test_grid_config().with_max_exposure(dec!(1));
    let mut h = Harness::new(config, dec!(101.5));

    // The buy on 100 already commits the whole cap
    let report = h.engine.sync_orders(dec!(101.5)).await.unwrap();
    assert_eq!(report.exposure_capped, 5);
    assert_eq!(h.level_state(5), (LevelState::Open, Some(OrderSide::Buy)));
    assert_eq!(h.level_state(4).0, LevelState::Empty);

    h.paper.set_price(dec!(100));
    h.pump_fills().await.unwrap();
    assert_eq!(h.engine.ledger().committed_exposure(), dec!(1));

    let report = mexc_grid_bot::Reconciler::run_pass(&mut h.engine).await.unwrap();
    assert_eq!(report.sync.exposure_capped, 5);
    assert!(h.paper.live_orders().iter().all(|order| order.side == OrderSide::Sell));
    assert!(h
        .events
        .events()
        .iter()
        .any(|e| matches!(e, GridEvent::ExposureCapped { index: 4, limit, .. } if *limit == dec!(1))));
}

#[tokio::test]
async fn test_price_sweep_through_buys_stays_within_cap() {
    let config = test_grid_config().with_max_exposure(dec!(2));
    let mut h = Harness::new(config, dec!(101.5));
    let report = h.engine.sync_orders(dec!(101.5)).await.unwrap();
    assert_eq!(report.exposure_capped, 4);
    assert_eq!(h.engine.ledger().open_buy_quantity(), dec!(2));

    // Every level below the price is crossed at once
    h.paper.set_price(dec!(89));
    h.pump_fills().await.unwrap();
    for _ in 0..3 {
        mexc_grid_bot::Reconciler::run_pass(&mut h.engine).await.unwrap();
        h.pump_fills().await.unwrap();
    }

    assert_eq!(h.engine.ledger().position(), dec!(2));
    assert!(h.engine.ledger().committed_exposure() + h.engine.ledger().open_buy_quantity() <= dec!(2));
}

#[tokio::test]
async fn test_orders_below_min_notional_are_skipped() {
    let config = test_grid_config().with_min_notional(dec!(95));
    let mut h = Harness::new(config, dec!(101.5));

    let report = h.engine.sync_orders(dec!(101.5)).await.unwrap();

    // Buys on 90, 92 and 94 are worth less than 95
    assert_eq!(report.below_min_notional, 3);
    assert_eq!(report.placed, 7);
    assert_eq!(h.level_state(2).0, LevelState::Empty);
    assert_eq!(h.level_state(3), (LevelState::Open, Some(OrderSide::Buy)));
    assert!(h.events.events().iter().any(
        |e| matches!(e, GridEvent::BelowMinNotional { index: 0, notional, minimum } if *notional == dec!(90) && *minimum == dec!(95))
    ));
}

fn funded_harness(pause: Decimal, kill: Decimal) -> Harness {
    let paper = std::sync::Arc::new(
        mexc_grid_bot::PaperExchange::new("BTCUSDT", dec!(101.5))
            .with_balance("USDT", dec!(2000))
            .with_balance("BTC", dec!(10)),
    );
    Harness::with_parts(
        test_grid_config().with_drawdown_limits(Some(pause), Some(kill)),
        paper,
        std::sync::Arc::new(mexc_grid_bot::db::InMemorySnapshotStore::new()),
    )
}

#[tokio::test]
async fn test_drawdown_pause_holds_back_buys_until_recovery() {
    let mut h = funded_harness(dec!(0.1), dec!(0.5));
    let report = mexc_grid_bot::Reconciler::run_pass(&mut h.engine).await.unwrap();
    assert_eq!(report.sync.placed, 10);
    assert_eq!(report.risk_gate, RiskGate::Clear);
    // 2000 USDT plus 10 BTC at 101.5
    assert_eq!(h.engine.ledger().peak_equity(), Some(dec!(3015)));

    // 1000 USDT leaves the account and the buy on 98 disappears
    h.paper.set_free_balance("USDT", dec!(1000));
    h.paper.vanish_order(&h.order_id(4)).unwrap();
    let report = mexc_grid_bot::Reconciler::run_pass(&mut h.engine).await.unwrap();

    assert_eq!(report.risk_gate, RiskGate::Paused);
    assert_eq!(report.sync.risk_blocked, 1);
    assert!(!h.level_state(4).0.is_live());
    assert_eq!(h.events.count(|e| matches!(e, GridEvent::DrawdownPaused { .. })), 1);
    assert!(h.engine.status().risk_gate == RiskGate::Paused);

    h.paper.set_free_balance("USDT", dec!(2000));
    let report = mexc_grid_bot::Reconciler::run_pass(&mut h.engine).await.unwrap();
    assert_eq!(report.risk_gate, RiskGate::Clear);
    assert_eq!(h.level_state(4), (LevelState::Open, Some(OrderSide::Buy)));
    assert_eq!(h.events.count(|e| matches!(e, GridEvent::DrawdownResumed { .. })), 1);
}

#[tokio::test]
async fn test_kill_switch_cancels_buys_and_latches() {
    let mut h = funded_harness(dec!(0.1), dec!(0.3));
    mexc_grid_bot::Reconciler::run_pass(&mut h.engine).await.unwrap();

    h.paper.set_free_balance("USDT", dec!(0));
    let report = mexc_grid_bot::Reconciler::run_pass(&mut h.engine).await.unwrap();

    assert_eq!(report.risk_gate, RiskGate::Killed);
    assert!(h.events.events().iter().any(|e| matches!(e, GridEvent::KillSwitchTripped { cancelled: 6, .. })));
    let live = h.paper.live_orders();
    assert_eq!(live.len(), 4);
    assert!(live.iter().all(|order| order.side == OrderSide::Sell));

    let snapshot = h.store.load("test-grid").unwrap().expect("snapshot saved");
    assert!(snapshot.ledger.kill_switch().is_some());

    // Latched even after the money is back
    h.paper.set_free_balance("USDT", dec!(2000));
    let report = mexc_grid_bot::Reconciler::run_pass(&mut h.engine).await.unwrap();
    assert_eq!(report.risk_gate, RiskGate::Killed);
    assert_eq!(report.sync.placed, 0);
    assert!(report.sync.risk_blocked > 0);

    assert!(h.engine.reset_kill_switch().unwrap());
    assert_eq!(h.engine.risk_gate(), RiskGate::Clear);
    assert!(h.engine.ledger().kill_switch().is_none());
    assert_eq!(h.events.count(|e| matches!(e, GridEvent::KillSwitchReset)), 1);

    let report = mexc_grid_bot::Reconciler::run_pass(&mut h.engine).await.unwrap();
    assert_eq!(report.risk_gate, RiskGate::Clear);
    assert!(report.sync.placed > 0);
}

#[tokio::test]
async fn test_insufficient_balance_skips_level() {
    let paper = std::sync::Arc::new(
        mexc_grid_bot::PaperExchange::new("BTCUSDT", dec!(101.5))
            .with_balance("USDT", dec!(250))
            .with_balance("BTC", dec!(100)),
    );
    let mut h = Harness::with_parts(
        test_grid_config(),
        paper,
        std::sync::Arc::new(mexc_grid_bot::db::InMemorySnapshotStore::new()),
    );

    let report = mexc_grid_bot::Reconciler::run_pass(&mut h.engine).await.unwrap();

    // 250 USDT funds the two buys nearest the price (100 and 98) only
    assert_eq!(report.sync.unfunded, 4);
    assert_eq!(h.level_state(5).0, LevelState::Open);
    assert_eq!(h.level_state(4).0, LevelState::Open);
    assert_eq!(h.level_state(3).0, LevelState::Empty);
    assert_eq!(h.events.count(|e| matches!(e, GridEvent::InsufficientFunds { .. })), 4);
}

#[tokio::test]
async fn test_rejected_placement_marks_level_failed() {
    let mut h = Harness::new(test_grid_config(), dec!(101.5));
    h.paper.inject_failure(PaperOp::Place, TradingError::Rejected("price outside limits".to_string()));

    let report = h.engine.sync_orders(dec!(101.5)).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.placed, 9);

    // Nearest level is tried first
    let level = h.engine.ledger().level(5).unwrap();
    assert_eq!(level.state, LevelState::Failed);
    assert!(!level.failure.as_ref().unwrap().retryable);

    // Not retried on its own
    let report = h.engine.sync_orders(dec!(101.5)).await.unwrap();
    assert_eq!(report.placed, 0);

    assert_eq!(h.engine.retry_failed().unwrap(), 1);
    let report = h.engine.sync_orders(dec!(101.5)).await.unwrap();
    assert_eq!(report.placed, 1);
    assert_eq!(h.level_state(5), (LevelState::Open, Some(OrderSide::Buy)));
}

#[tokio::test]
async fn test_recenter_commits_when_all_cancels_confirm() {
    let mut h = Harness::new(test_grid_config(), dec!(101.5));
    h.engine.sync_orders(dec!(101.5)).await.unwrap();

    assert!(h.engine.recenter(dec!(130)).await.unwrap());

    let layout = h.engine.ledger().layout();
    assert_eq!(layout.lower_bound(), dec!(120));
    assert_eq!(layout.upper_bound(), dec!(140));
    assert_eq!(h.engine.ledger().live_order_count(), 0);
    assert!(h.paper.live_orders().is_empty());
    assert_eq!(h.events.count(|e| matches!(e, GridEvent::Recentered { shift: 15, .. })), 1);
}

#[tokio::test]
async fn test_recenter_with_failing_cancel_leaves_ledger_untouched() {
    let mut config = test_grid_config();
    config.recenter_max_rounds = 1;
    let mut h = Harness::new(config, dec!(101.5));
    h.engine.sync_orders(dec!(101.5)).await.unwrap();
    let before = h.engine.ledger().clone();

    h.paper.inject_failure(PaperOp::Cancel, TradingError::Rejected("system busy".to_string()));
    assert!(!h.engine.recenter(dec!(130)).await.unwrap());

    assert_eq!(h.engine.ledger(), &before);
    assert_eq!(h.events.count(|e| matches!(e, GridEvent::RecenterAborted { unconfirmed: 1 })), 1);

    // Cancelled orders are resubmitted by the next reconciliation at the old window
    let report = mexc_grid_bot::Reconciler::run_pass(&mut h.engine).await.unwrap();
    assert!(!report.recentered);
    assert_eq!(h.paper.live_orders().len(), 10);
}

#[tokio::test]
async fn test_recenter_retries_cancels_in_later_rounds() {
    let mut h = Harness::new(test_grid_config(), dec!(101.5));
    h.engine.sync_orders(dec!(101.5)).await.unwrap();

    h.paper.inject_failures(PaperOp::Cancel, TradingError::Rejected("system busy".to_string()), 2);
    assert!(h.engine.recenter(dec!(130)).await.unwrap());
    assert!(h.paper.live_orders().is_empty());
}

#[tokio::test]
async fn test_store_failure_halts_placement_until_flush_succeeds() {
    let mut h = Harness::new(test_grid_config(), dec!(101.5));
    h.store.fail_writes(true);

    let report = h.engine.sync_orders(dec!(101.5)).await.unwrap();
    assert!(report.halted);
    assert!(h.engine.is_halted());
    // Nothing reached the exchange: the slot is reserved in the ledger first
    assert!(h.paper.live_orders().is_empty());
    assert_eq!(h.engine.ledger().live_order_count(), 0);
    assert_eq!(h.events.count(|e| matches!(e, GridEvent::PersistenceHalted { .. })), 1);

    let report = h.engine.sync_orders(dec!(101.5)).await.unwrap();
    assert!(report.halted);
    assert_eq!(report.placed, 0);

    h.store.fail_writes(false);
    let report = h.engine.sync_orders(dec!(101.5)).await.unwrap();
    assert!(!report.halted);
    assert_eq!(report.placed, 10);
    assert_eq!(h.events.count(|e| matches!(e, GridEvent::PersistenceRecovered)), 1);
}

#[tokio::test]
async fn test_restart_adopts_order_whose_ack_was_lost() {
    let store = std::sync::Arc::new(mexc_grid_bot::db::InMemorySnapshotStore::new());
    let paper = std::sync::Arc::new(mexc_grid_bot::PaperExchange::new("BTCUSDT", dec!(101.5)));

    {
        let mut h = Harness::with_parts(test_grid_config(), paper.clone(), store.clone());
        // First placement lands but every answer is lost
        paper.lose_place_acks(1);
        paper.inject_failures(PaperOp::Place, TradingError::TransientNetwork("timeout".to_string()), 2);
        h.engine.sync_orders(dec!(101.5)).await.unwrap();
        assert_eq!(h.level_state(5).0, LevelState::PendingOpen);
    }

    let mut h = Harness::with_parts(test_grid_config(), paper.clone(), store);
    assert!(h.engine.was_resumed());
    let report = h.engine.start().await.unwrap();

    assert_eq!(h.level_state(5), (LevelState::Open, Some(OrderSide::Buy)));
    assert_eq!(report.sync.placed, 0);
    assert_eq!(paper.live_orders().len(), 10);
}

#[tokio::test]
async fn test_cancel_all_retires_every_order() {
    let mut h = Harness::new(test_grid_config(), dec!(101.5));
    h.engine.sync_orders(dec!(101.5)).await.unwrap();

    assert_eq!(h.engine.cancel_all().await.unwrap(), 10);
    assert!(h.paper.live_orders().is_empty());
    assert_eq!(h.engine.ledger().live_order_count(), 0);
    assert_eq!(h.engine.ledger().retired_orders().len(), 10);
}

#[tokio::test]
async fn test_stop_placing_blocks_new_orders() {
    let mut h = Harness::new(test_grid_config(), dec!(101.5));
    h.engine.stop_placing();

    let report = h.engine.sync_orders(dec!(101.5)).await.unwrap();
    assert_eq!(report.placed, 0);
    assert!(h.paper.live_orders().is_empty());
    assert_eq!(h.events.count(|e| matches!(e, GridEvent::ShutdownStarted)), 1);
}
