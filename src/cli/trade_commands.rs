// Trade command implementations: run, validate and inspect a grid session
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use mexc_grid_bot::clients::{ExchangeApi, ExchangeGateway, MexcClient, PaperExchange};
use mexc_grid_bot::core::{
    EventSink, GracefulShutdown, GridEngine, GridLedger, GridRunner, GridStatus, LevelState,
    NullEventSink, RiskGate, RunnerOptions, TracingEventSink,
};
use mexc_grid_bot::{open_store, Config, PreFlightValidator, TradingError, TradingResult};

/// Per-tick price move of the dry-run random walk
const PAPER_VOLATILITY: f64 = 0.002;

/// Exchange the session trades on: MEXC, or an in-process paper market for dry runs
fn build_exchange(config: &Config, dry_run: bool) -> TradingResult<Arc<dyn ExchangeApi>> {
    if !dry_run {
        return Ok(Arc::new(MexcClient::new(&config.exchange)?));
    }

    let grid = &config.grid;
    let levels = Decimal::from(grid.layout().level_count() as u64);
    let start = (grid.lower_bound + grid.upper_bound) / Decimal::TWO;
    let paper = PaperExchange::new(&grid.symbol, start)
        .with_random_walk(PAPER_VOLATILITY, grid.tick_size)
        .with_balance(&grid.quote_asset, grid.upper_bound * grid.quantity_per_level * levels)
        .with_balance(&grid.base_asset, grid.quantity_per_level * levels);
    info!("🧪 Paper market for {} starting at {}", grid.symbol, start);
    Ok(Arc::new(paper))
}

/// Dry runs keep their ledger apart from the live session
fn session_config(mut config: Config, dry_run: bool) -> Config {
    if dry_run && !config.grid.session_id.ends_with("-paper") {
        config.grid.session_id = format!("{}-paper", config.grid.session_id);
    }
    config
}

pub async fn validate(config: Config, dry_run: bool) -> TradingResult<bool> {
    let config = session_config(config, dry_run);
    let exchange = build_exchange(&config, dry_run)?;
    let result = PreFlightValidator::new(config)
        .validate_for_trading(exchange.as_ref(), !dry_run)
        .await;
    result.display();
    Ok(result.passed)
}

pub async fn run_grid(config: Config, dry_run: bool, cancel_on_exit: bool, reset_kill_switch: bool) -> TradingResult<()> {
    if dry_run {
        info!("🧪 DRY RUN mode (paper trading)");
    } else {
        info!("🚀 LIVE TRADING on MEXC");
        warn!("⚠️  Real money!");
    }

    let config = session_config(config, dry_run);
    let exchange = build_exchange(&config, dry_run)?;

    info!("");
    let validation = PreFlightValidator::new(config.clone())
        .validate_for_trading(exchange.as_ref(), !dry_run)
        .await;
    validation.display();
    if !validation.passed {
        error!("");
        error!("❌ Pre-flight validation failed. Cannot proceed.");
        return Err(TradingError::ConfigurationInvalid(
            "critical validation checks did not pass".to_string(),
        ));
    }

    let store = open_store(&config.persistence)?;
    let shutdown = GracefulShutdown::new();
    let gateway = Arc::new(ExchangeGateway::new(
        exchange,
        &config.grid.symbol,
        &config.gateway,
        shutdown,
    ));
    let events: Arc<dyn EventSink> = if config.logging.log_events {
        Arc::new(TracingEventSink)
    } else {
        Arc::new(NullEventSink)
    };

    let mut engine = GridEngine::new(config.grid.clone(), store, gateway, events)?;
    if let Some(kill) = engine.ledger().kill_switch().cloned() {
        if reset_kill_switch {
            engine.reset_kill_switch()?;
            info!("🔓 Kill switch from {} lifted, drawdown peak reset", kill.tripped_at);
        } else {
            warn!(
                "🚨 Kill switch latched at {} drawdown since {}; only fills are tracked (use --reset-kill-switch)",
                kill.drawdown, kill.tripped_at
            );
        }
    }
    let options = RunnerOptions {
        cancel_on_shutdown: cancel_on_exit,
        ..RunnerOptions::from_config(&config)
    };

    info!("✅ Engine initialized, press Ctrl-C to stop");
    let status = GridRunner::new(engine, options)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;

    print_status(&status);
    Ok(())
}

pub async fn show_status(config: Config, detailed: bool) -> TradingResult<()> {
    let store = open_store(&config.persistence)?;
    let session_id = &config.grid.session_id;

    let Some(snapshot) = store.load(session_id)? else {
        info!("📭 No persisted ledger for session {}", session_id);
        let others = store.sessions()?;
        if !others.is_empty() {
            info!("   Known sessions: {}", others.join(", "));
        }
        return Ok(());
    };

    let saved_at = snapshot.saved_at;
    let ledger = GridLedger::restore(snapshot)?;
    info!("💾 Snapshot saved at {}", saved_at);
    print_status(&GridStatus::from_ledger(&ledger, None));

    if detailed {
        info!("");
        info!("📋 Levels");
        for level in ledger.levels().filter(|level| level.state != LevelState::Empty) {
            info!(
                "  {:>4}  {:>14}  {:<4}  {:?}{}",
                level.index,
                level.price,
                level.side.map(|side| side.as_str()).unwrap_or("-"),
                level.state,
                level
                    .failure
                    .as_ref()
                    .map(|failure| format!("  ({})", failure.reason))
                    .unwrap_or_default()
            );
        }
        if !ledger.retired_orders().is_empty() {
            info!("  {} retired order(s) still accepting late fills", ledger.retired_orders().len());
        }
    }
    Ok(())
}

fn print_status(status: &GridStatus) {
    info!("📊 Grid {} ({})", status.session_id, status.symbol);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  Window:        {} .. {} ({} levels)", status.lower_bound, status.upper_bound, status.levels);
    info!(
        "  Orders:        {} open, {} pending, {} awaiting replacement, {} failed",
        status.open_orders, status.pending, status.filled_awaiting_replacement, status.failed
    );
    info!("  Position:      {}", status.position);
    info!("  Realized P&L:  {}", status.realized_pnl);
    if let (Some(price), Some(unrealized)) = (status.last_price, status.unrealized_pnl) {
        info!("  Last price:    {} (unrealized {})", price, unrealized);
    }
    info!("  Fills:         {} (revision {})", status.fill_count, status.revision);
    if status.risk_gate != RiskGate::Clear {
        warn!("  ⚠️  Drawdown gate: {:?}", status.risk_gate);
    }
    if status.halted {
        warn!("  ⚠️  Placement halted: ledger could not be persisted");
    }
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
