// Event loop: one consumer owns the engine, fills and reconciliation ticks arrive over channels

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{pin_mut, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clients::gateway::ExchangeGateway;
use crate::config::Config;
use crate::core::engine::{GridEngine, GridStatus};
use crate::core::types::FillEvent;
use crate::error::{TradingError, TradingResult};

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Time between reconciliation passes
    pub reconcile_interval: Duration,
    /// How long shutdown waits for in-flight gateway calls
    pub shutdown_timeout: Duration,
    /// Capacity of the fill queue between the stream pump and the engine
    pub fill_queue_depth: usize,
    /// Cancel the grid's orders before exiting
    pub cancel_on_shutdown: bool,
}

impl RunnerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconcile_interval: Duration::from_secs(config.grid.poll_interval_secs),
            shutdown_timeout: Duration::from_secs(config.gateway.shutdown_timeout_secs),
            ..Self::default()
        }
    }
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            fill_queue_depth: 256,
            cancel_on_shutdown: false,
        }
    }
}

pub struct GridRunner {
    engine: GridEngine,
    options: RunnerOptions,
}

impl GridRunner {
    pub fn new(engine: GridEngine, options: RunnerOptions) -> Self {
        Self { engine, options }
    }

    pub fn engine(&self) -> &GridEngine {
        &self.engine
    }

    /// Trade until `shutdown_signal` resolves, then shut down in order:
    /// stop placing, wait for in-flight calls, apply queued fills, cancel if
    /// asked, sweep executions that landed meanwhile, flush, disconnect.
    /// Fills the pump still hands over while disconnecting are applied and
    /// flushed again.
    pub async fn run<S>(mut self, shutdown_signal: S) -> TradingResult<GridStatus>
    where
        S: Future<Output = ()>,
    {
        let gateway = Arc::clone(self.engine.gateway());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (fill_tx, mut fill_rx) = mpsc::channel::<FillEvent>(self.options.fill_queue_depth.max(1));
        let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);

        let pump = spawn_fill_pump(Arc::clone(&gateway), stop_rx.clone(), fill_tx);
        let ticker = spawn_ticker(self.options.reconcile_interval, stop_rx, tick_tx);

        let started = self.engine.start().await;
        let mut fatal = match started {
            Ok(report) => {
                info!(
                    "✅ Startup reconciliation: price {}, {} live orders, {} repaired, {} placed",
                    report.price, report.live_orders, report.repaired, report.sync.placed
                );
                None
            }
            Err(e) if e.is_fatal() => {
                error!("🚨 Startup failed: {}", e);
                Some(e)
            }
            Err(e) => {
                warn!("⚠️  Startup reconciliation incomplete, retrying on the next tick: {}", e);
                None
            }
        };

        if fatal.is_none() {
            fatal = self.event_loop(shutdown_signal, &mut fill_rx, &mut tick_rx).await;
        }

        self.engine.stop_placing();
        gateway
            .shutdown()
            .wait_for_completion(self.options.shutdown_timeout)
            .await;
        self.drain_fills(&mut fill_rx).await;

        if self.options.cancel_on_shutdown {
            match self.engine.cancel_all().await {
                Ok(count) => info!("🗑️  Cancelled {} order(s) on exit", count),
                Err(e) => warn!("⚠️  Cancelling orders on exit failed: {}", e),
            }
        }

        self.sweep_fills(&mut fill_rx).await;
        let mut flushed = self.engine.flush();

        let _ = stop_tx.send(true);
        ticker.abort();
        // The pump empties its stream buffer, then drops its sender
        let mut late = 0usize;
        while let Some(fill) = fill_rx.recv().await {
            self.handle_fill(fill).await;
            late += 1;
        }
        if let Err(e) = pump.await {
            warn!("Fill pump ended abnormally: {}", e);
        }
        if late > 0 {
            info!("📥 Applied {} fill(s) delivered while disconnecting", late);
            flushed = self.engine.flush();
        }

        self.engine.finish_shutdown();
        if let Some(e) = fatal {
            return Err(e);
        }
        flushed?;
        Ok(self.engine.status())
    }

    /// Fills first, ticks second; a tick drains queued fills before reconciling
    /// so a pass never repairs an execution that is already waiting.
    /// Returns the error that ended the loop, if any.
    async fn event_loop<S>(
        &mut self,
        shutdown_signal: S,
        fill_rx: &mut mpsc::Receiver<FillEvent>,
        tick_rx: &mut mpsc::Receiver<()>,
    ) -> Option<TradingError>
    where
        S: Future<Output = ()>,
    {
        pin_mut!(shutdown_signal);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_signal => {
                    info!("📴 Shutdown requested");
                    return None;
                }
                Some(fill) = fill_rx.recv() => {
                    self.handle_fill(fill).await;
                }
                Some(()) = tick_rx.recv() => {
                    self.drain_fills(fill_rx).await;
                    if let Err(e) = self.reconcile().await {
                        return Some(e);
                    }
                }
                else => return None,
            }
        }
    }

    /// Poll the exchange directly for executions, then apply whatever is queued.
    /// The pump shares the gateway's cursor, so nothing is delivered twice.
    async fn sweep_fills(&mut self, fill_rx: &mut mpsc::Receiver<FillEvent>) {
        self.drain_fills(fill_rx).await;
        let polled = self.engine.gateway().poll_fills().await;
        match polled {
            Ok(fills) => {
                if !fills.is_empty() {
                    debug!("Shutdown sweep found {} fill(s)", fills.len());
                }
                for fill in fills {
                    self.handle_fill(fill).await;
                }
            }
            Err(e) => warn!("⚠️  Final fill sweep failed [{}]: {}", e.category(), e),
        }
        self.drain_fills(fill_rx).await;
    }

    async fn handle_fill(&mut self, fill: FillEvent) {
        match self.engine.on_fill(fill).await {
            Ok(_) => {}
            Err(TradingError::UnknownOrder(id)) => debug!("Fill for order {} not owned by this grid", id),
            Err(e) => warn!("⚠️  Fill not applied [{}], reconciliation will catch up: {}", e.category(), e),
        }
    }

    async fn drain_fills(&mut self, fill_rx: &mut mpsc::Receiver<FillEvent>) {
        while let Ok(fill) = fill_rx.try_recv() {
            self.handle_fill(fill).await;
        }
    }

    /// One reconciliation pass. Only configuration errors end the loop;
    /// persistence failures halt placement inside the engine and are retried.
    async fn reconcile(&mut self) -> TradingResult<()> {
        match crate::core::reconcile::Reconciler::run_pass(&mut self.engine).await {
            Ok(report) => {
                debug!(
                    "Reconciled at {}: {} live, {} discrepancies, {} placed",
                    report.price, report.live_orders, report.discrepancies, report.sync.placed
                );
                Ok(())
            }
            Err(e @ TradingError::ConfigurationInvalid(_)) => Err(e),
            Err(e) => {
                warn!("⚠️  Reconciliation pass failed [{}]: {}", e.category(), e);
                Ok(())
            }
        }
    }
}

fn spawn_fill_pump(
    gateway: Arc<ExchangeGateway>,
    stop: watch::Receiver<bool>,
    fills: mpsc::Sender<FillEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = gateway.stream_fills(stop);
        pin_mut!(stream);
        while let Some(fill) = stream.next().await {
            if fills.send(fill).await.is_err() {
                break;
            }
        }
        debug!("Fill pump stopped");
    })
}

fn spawn_ticker(period: Duration, mut stop: watch::Receiver<bool>, ticks: mpsc::Sender<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Startup already ran a pass
        timer.tick().await;
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    // A pass already queued covers this tick
                    let _ = ticks.try_send(());
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::paper::{PaperExchange, PaperOp};
    use crate::config::{GatewayConfig, GridConfig};
    use crate::core::error_handling::GracefulShutdown;
    use crate::core::events::{GridEvent, RecordingSink};
    use crate::core::types::{LevelState, OrderSide};
    use crate::db::InMemorySnapshotStore;
    use rust_decimal_macros::dec;

    fn runner_at(price: rust_decimal::Decimal) -> (GridRunner, Arc<PaperExchange>, Arc<RecordingSink>) {
        let config = GridConfig::arithmetic("BTCUSDT", dec!(90), dec!(110), dec!(2), dec!(1)).with_max_exposure(dec!(10));
        let paper = Arc::new(PaperExchange::new("BTCUSDT", price));
        let gateway = ExchangeGateway::new(paper.clone(), "BTCUSDT", &GatewayConfig::default(), GracefulShutdown::new());
        let sink = Arc::new(RecordingSink::new());
        let engine = GridEngine::new(
            config,
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(gateway),
            sink.clone(),
        )
        .unwrap();
        (GridRunner::new(engine, RunnerOptions::default()), paper, sink)
    }

    #[tokio::test]
    async fn test_queued_fill_is_applied_before_the_tick() {
        let (mut runner, paper, sink) = runner_at(dec!(101.5));
        runner.engine.sync_orders(dec!(101.5)).await.unwrap();
        assert_eq!(paper.live_orders().len(), 10);

        paper.set_price(dec!(100));
        let fills = runner.engine.gateway().poll_fills().await.unwrap();
        assert_eq!(fills.len(), 1);

        let (fill_tx, mut fill_rx) = mpsc::channel(4);
        let (tick_tx, mut tick_rx) = mpsc::channel(1);
        tick_tx.try_send(()).unwrap();
        for fill in fills {
            fill_tx.try_send(fill).unwrap();
        }

        let fatal = runner
            .event_loop(tokio::time::sleep(Duration::from_millis(150)), &mut fill_rx, &mut tick_rx)
            .await;
        assert!(fatal.is_none());

        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, GridEvent::OrderFilled { index: Some(5), synthetic: false, complete: true, .. })));
        assert_eq!(sink.count(|e| matches!(e, GridEvent::DriftRepaired { .. })), 0);

        let level = runner.engine.ledger().level(6).unwrap();
        assert_eq!((level.state, level.side), (LevelState::Open, Some(OrderSide::Sell)));
        assert_eq!(runner.engine.ledger().position(), dec!(1));

        // One replacement, nothing resubmitted by the pass
        assert_eq!(paper.call_count(PaperOp::Place), 11);
        let live = paper.live_orders();
        assert_eq!(live.len(), 10);
        let mut prices: Vec<_> = live.iter().map(|order| order.price).collect();
        prices.sort();
        prices.dedup();
        assert_eq!(prices.len(), 10);

        drop(fill_tx);
        drop(tick_tx);
    }

    #[tokio::test]
    async fn test_sweep_picks_up_fills_missed_by_the_pump() {
        let (mut runner, paper, _) = runner_at(dec!(101.5));
        runner.engine.sync_orders(dec!(101.5)).await.unwrap();

        let filled_id = runner.engine.ledger().level(5).unwrap().exchange_order_id.clone().unwrap();
        runner.engine.stop_placing();
        paper.set_price(dec!(100));
        runner.engine.cancel_all().await.unwrap();
        assert_eq!(runner.engine.ledger().position(), dec!(0));

        let (_fill_tx, mut fill_rx) = mpsc::channel::<FillEvent>(4);
        runner.sweep_fills(&mut fill_rx).await;

        assert_eq!(runner.engine.ledger().position(), dec!(1));
        assert!(!runner.engine.ledger().retired_orders().contains_key(&filled_id));
    }
}
