// Grid strategy engine: keeps the ladder of orders on the exchange in line with the ledger

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clients::gateway::ExchangeGateway;
use crate::config::GridConfig;
use crate::core::events::{DriftKind, EventSink, GridEvent};
use crate::core::ledger::{DesiredAction, FillOutcome, GridLedger, GridLevel, LevelAction, PersistentLedger};
use crate::core::types::{Balance, ClientOrderId, FillEvent, LevelState, LiveOrder, OrderSide};
use crate::db::SnapshotStore;
use crate::error::{TradingError, TradingResult};

/// What one `sync_orders` call did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub placed: usize,
    pub failed: usize,
    pub exposure_capped: usize,
    pub unfunded: usize,
    pub below_min_notional: usize,
    /// Actions held back by the drawdown gate
    pub risk_blocked: usize,
    /// Placement skipped because the ledger could not be flushed
    pub halted: bool,
}

/// Placement permission derived from account drawdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskGate {
    #[default]
    Clear,
    /// Drawdown above the pause limit: only sells go out
    Paused,
    /// Kill switch latched: nothing goes out
    Killed,
}

impl RiskGate {
    pub fn allows(&self, side: OrderSide) -> bool {
        match self {
            RiskGate::Clear => true,
            RiskGate::Paused => side == OrderSide::Sell,
            RiskGate::Killed => false,
        }
    }
}

/// Point-in-time summary of a grid session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridStatus {
    pub session_id: String,
    pub symbol: String,
    pub lower_bound: Decimal,
    pub upper_bound: Decimal,
    pub levels: usize,
    pub open_orders: usize,
    pub pending: usize,
    pub filled_awaiting_replacement: usize,
    pub failed: usize,
    pub position: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Option<Decimal>,
    pub last_price: Option<Decimal>,
    pub fill_count: u64,
    pub revision: u64,
    pub halted: bool,
    pub risk_gate: RiskGate,
}

impl GridStatus {
    pub fn from_ledger(ledger: &GridLedger, last_price: Option<Decimal>) -> Self {
        let layout = ledger.layout();
        Self {
            session_id: ledger.session_id().to_string(),
            symbol: ledger.symbol().to_string(),
            lower_bound: layout.lower_bound(),
            upper_bound: layout.upper_bound(),
            levels: layout.level_count(),
            open_orders: ledger.count_in_state(LevelState::Open),
            pending: ledger.count_in_state(LevelState::PendingOpen)
                + ledger.count_in_state(LevelState::PendingCancel),
            filled_awaiting_replacement: ledger.count_in_state(LevelState::Filled),
            failed: ledger.count_in_state(LevelState::Failed),
            position: ledger.position(),
            realized_pnl: ledger.realized_pnl(),
            unrealized_pnl: last_price.map(|price| ledger.unrealized_pnl(price)),
            last_price,
            fill_count: ledger.fill_count(),
            revision: ledger.revision(),
            halted: false,
            risk_gate: if ledger.kill_switch().is_some() {
                RiskGate::Killed
            } else {
                RiskGate::Clear
            },
        }
    }
}

pub struct GridEngine {
    config: GridConfig,
    ledger: PersistentLedger,
    gateway: Arc<ExchangeGateway>,
    events: Arc<dyn EventSink>,
    balances: HashMap<String, Balance>,
    last_price: Option<Decimal>,
    halted: bool,
    gate: RiskGate,
    resumed: bool,
}

impl GridEngine {
    /// Load the session's ledger from `store`, or create it from config
    pub fn new(
        config: GridConfig,
        store: Arc<dyn SnapshotStore>,
        gateway: Arc<ExchangeGateway>,
        events: Arc<dyn EventSink>,
    ) -> TradingResult<Self> {
        config.validate()?;
        let (ledger, resumed) = PersistentLedger::open(&config, store)?;
        let gate = if ledger.ledger().kill_switch().is_some() {
            RiskGate::Killed
        } else {
            RiskGate::Clear
        };
        Ok(Self {
            config,
            ledger,
            gateway,
            events,
            balances: HashMap::new(),
            last_price: None,
            halted: false,
            gate,
            resumed,
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn ledger(&self) -> &GridLedger {
        self.ledger.ledger()
    }

    pub fn gateway(&self) -> &Arc<ExchangeGateway> {
        &self.gateway
    }

    pub fn was_resumed(&self) -> bool {
        self.resumed
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn risk_gate(&self) -> RiskGate {
        self.gate
    }

    pub fn last_price(&self) -> Option<Decimal> {
        self.last_price
    }

    pub fn status(&self) -> GridStatus {
        GridStatus {
            halted: self.halted,
            risk_gate: self.gate,
            ..GridStatus::from_ledger(self.ledger(), self.last_price)
        }
    }

    pub(crate) fn emit(&self, event: GridEvent) {
        self.events.emit(event);
    }

    /// Mutate the ledger; a failed flush halts placement until a later flush succeeds
    pub(crate) fn mutate<T, F>(&mut self, f: F) -> TradingResult<T>
    where
        F: FnOnce(&mut GridLedger) -> TradingResult<T>,
    {
        let result = self.ledger.mutate(f);
        self.note_persistence(&result);
        result
    }

    fn commit(&mut self, next: GridLedger) -> TradingResult<()> {
        let result = self.ledger.commit(next);
        self.note_persistence(&result);
        result
    }

    fn note_persistence<T>(&mut self, result: &TradingResult<T>) {
        if let Err(TradingError::PersistenceFailure(reason)) = result {
            if !self.halted {
                self.halted = true;
                self.emit(GridEvent::PersistenceHalted { reason: reason.clone() });
            }
        }
    }

    /// Write the ledger out; clears a persistence halt on success
    pub fn flush(&mut self) -> TradingResult<()> {
        let result = self.ledger.flush();
        if result.is_ok() && self.halted {
            self.halted = false;
            self.emit(GridEvent::PersistenceRecovered);
        }
        self.note_persistence(&result);
        result
    }

    // Startup

    /// Resolve in-doubt levels left by a previous run, then reconcile once
    pub async fn start(&mut self) -> TradingResult<crate::core::reconcile::ReconcileReport> {
        info!(
            "🚀 Starting grid {} on {} via {} ({} levels, {} .. {})",
            self.config.session_id,
            self.config.symbol,
            self.gateway.exchange_name(),
            self.ledger().layout().level_count(),
            self.ledger().layout().lower_bound(),
            self.ledger().layout().upper_bound()
        );
        if self.resumed {
            self.resume().await?;
        }
        crate::core::reconcile::Reconciler::run_pass(self).await
    }

    /// PendingOpen levels are looked up by client id, PendingCancel levels are cancelled again
    pub async fn resume(&mut self) -> TradingResult<()> {
        let in_doubt: Vec<(i64, LevelState)> = self
            .ledger()
            .levels()
            .filter(|level| matches!(level.state, LevelState::PendingOpen | LevelState::PendingCancel))
            .map(|level| (level.index, level.state))
            .collect();

        if in_doubt.is_empty() {
            return Ok(());
        }
        info!("🔍 Resolving {} in-doubt level(s) from the previous run", in_doubt.len());

        for (index, state) in in_doubt {
            let outcome = match state {
                LevelState::PendingOpen => self.resolve_pending_open(index).await,
                _ => self.finish_cancel(index).await,
            };
            if let Err(e) = outcome {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("⚠️  Level {} left in doubt, reconciliation will retry: {}", index, e);
            }
        }
        Ok(())
    }

    /// Find out whether an unacknowledged placement reached the exchange
    pub(crate) async fn resolve_pending_open(&mut self, index: i64) -> TradingResult<()> {
        let Some(handle) = self.ledger().level(index).and_then(|level| level.handle()) else {
            return self.mutate(|l| l.mark_failed(index, "placement has no client order id", true));
        };

        match self.gateway.find_by_client_id(&handle.client_order_id).await? {
            Some(order) => self.adopt_order(index, &order).await,
            None => {
                debug!("Order {} never reached the exchange", handle.client_order_id);
                self.mutate(|l| l.mark_failed(index, "placement not acknowledged by the exchange", true))
            }
        }
    }

    async fn finish_cancel(&mut self, index: i64) -> TradingResult<()> {
        let Some(handle) = self.ledger().level(index).and_then(|level| level.handle()) else {
            self.mutate(|l| Ok(l.retire_level(index)))?;
            return Ok(());
        };
        match self.gateway.cancel_order(&handle).await {
            Ok(()) | Err(TradingError::NotFound(_)) => {
                self.mutate(|l| Ok(l.retire_level(index)))?;
                self.emit(GridEvent::OrderCancelled {
                    index,
                    exchange_order_id: handle.exchange_order_id,
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Bind an exchange order to a level and catch up on its executions
    pub(crate) async fn adopt_order(&mut self, index: i64, order: &LiveOrder) -> TradingResult<()> {
        let exchange_order_id = order.exchange_order_id.clone();
        self.mutate(|l| l.confirm_open(index, &exchange_order_id))?;
        self.emit(GridEvent::DriftRepaired {
            kind: DriftKind::AdoptedOrder,
            index: Some(index),
            detail: format!("order {} is {:?} on the exchange", exchange_order_id, order.status),
        });

        self.catch_up_executions(index, order).await?;

        let still_open = self
            .ledger()
            .level(index)
            .map(|level| level.state == LevelState::Open)
            .unwrap_or(false);
        if still_open && !order.status.is_open() {
            let reason = format!("order {} ended as {:?}", exchange_order_id, order.status);
            self.mutate(|l| l.mark_failed(index, &reason, true))?;
        }
        Ok(())
    }

    /// Synthesize a fill for quantity the exchange executed but the ledger never saw
    pub(crate) async fn catch_up_executions(&mut self, index: i64, order: &LiveOrder) -> TradingResult<bool> {
        let recorded = self
            .ledger()
            .level(index)
            .map(|level| level.filled_quantity)
            .unwrap_or(Decimal::ZERO);
        if order.executed_quantity <= recorded {
            return Ok(false);
        }

        let mut fill = FillEvent::new(
            &order.exchange_order_id,
            order.executed_quantity - recorded,
            order.price,
            chrono::Utc::now(),
        );
        fill.cumulative_quantity = Some(order.executed_quantity);
        fill.synthetic = true;

        self.emit(GridEvent::DriftRepaired {
            kind: DriftKind::MissedFill,
            index: Some(index),
            detail: format!(
                "exchange executed {} of order {}, ledger had {}",
                order.executed_quantity, order.exchange_order_id, recorded
            ),
        });
        self.on_fill(fill).await?;
        Ok(true)
    }

    // Fills

    /// Apply one execution, then place the mirrored order if a level completed
    pub async fn on_fill(&mut self, event: FillEvent) -> TradingResult<FillOutcome> {
        let outcome = match self.mutate(|l| l.apply_fill(&event)) {
            Ok(outcome) => outcome,
            Err(TradingError::UnknownOrder(id)) => {
                self.emit(GridEvent::UnknownFill {
                    exchange_order_id: id.clone(),
                });
                return Err(TradingError::UnknownOrder(id));
            }
            Err(e) => return Err(e),
        };

        match &outcome {
            FillOutcome::Duplicate | FillOutcome::Absorbed { .. } => {
                self.emit(GridEvent::DuplicateFill {
                    exchange_order_id: event.exchange_order_id.clone(),
                });
            }
            FillOutcome::Partial { index, side, quantity, .. } => {
                self.emit(GridEvent::OrderFilled {
                    index: Some(*index),
                    side: *side,
                    price: event.price,
                    quantity: *quantity,
                    complete: false,
                    synthetic: event.synthetic,
                });
            }
            FillOutcome::Completed {
                index,
                side,
                quantity,
                average_price,
                replacement,
            } => {
                self.emit(GridEvent::OrderFilled {
                    index: Some(*index),
                    side: *side,
                    price: *average_price,
                    quantity: *quantity,
                    complete: true,
                    synthetic: event.synthetic,
                });
                if let Some(target) = replacement {
                    self.place_replacement(*index, *target, side.opposite()).await?;
                }
            }
            FillOutcome::Retired { side, quantity } => {
                self.emit(GridEvent::OrderFilled {
                    index: None,
                    side: *side,
                    price: event.price,
                    quantity: *quantity,
                    complete: false,
                    synthetic: event.synthetic,
                });
            }
        }
        Ok(outcome)
    }

    async fn place_replacement(&mut self, filled_index: i64, target: i64, side: OrderSide) -> TradingResult<()> {
        self.mutate(|l| Ok(l.settle_covered_replacements()))?;

        let Some(slot) = self.ledger().level(target) else {
            return Ok(());
        };
        let owed = self
            .ledger()
            .level(filled_index)
            .map(|level| level.state == LevelState::Filled)
            .unwrap_or(false);
        if !owed || !slot.is_free() {
            debug!("Replacement for level {} deferred, level {} is {:?}", filled_index, target, slot.state);
            return Ok(());
        }
        if self.halted || self.gateway.shutdown().is_shutting_down() {
            return Ok(());
        }

        let action = LevelAction {
            index: target,
            price: slot.price,
            action: DesiredAction::Replace { filled_index, side },
        };
        let mut report = SyncReport::default();
        self.execute_action(&action, &mut report).await
    }

    // Placement

    /// Place whatever the ledger says is missing at `price`
    pub async fn sync_orders(&mut self, price: Decimal) -> TradingResult<SyncReport> {
        let mut report = SyncReport::default();
        self.last_price = Some(price);

        if self.halted && self.flush().is_err() {
            report.halted = true;
            return Ok(report);
        }
        if self.gateway.shutdown().is_shutting_down() {
            return Ok(report);
        }

        let settled = self.mutate(|l| Ok(l.settle_covered_replacements()))?;
        if settled > 0 {
            debug!("Settled {} replacement(s) already covered on the exchange", settled);
        }

        let actions = self.ledger().levels_needing_action(price);
        for action in actions {
            if self.halted {
                report.halted = true;
                break;
            }
            if self.gateway.shutdown().is_shutting_down() {
                break;
            }
            match self.execute_action(&action, &mut report).await {
                Err(TradingError::PersistenceFailure(_)) => {
                    report.halted = true;
                    break;
                }
                other => other?,
            }
        }

        if report.placed > 0 || report.failed > 0 {
            info!(
                "📊 Sync at {}: {} placed, {} failed, {} capped, {} unfunded, {} below minimum",
                price, report.placed, report.failed, report.exposure_capped, report.unfunded, report.below_min_notional
            );
        }
        Ok(report)
    }

    async fn execute_action(&mut self, action: &LevelAction, report: &mut SyncReport) -> TradingResult<()> {
        let side = action.action.side();
        let quantity = self.ledger().order_quantity();

        if !self.gate.allows(side) {
            debug!("{} on level {} held back, risk gate {:?}", side, action.index, self.gate);
            report.risk_blocked += 1;
            return Ok(());
        }

        match self.check_risk(side, action.price, quantity) {
            Ok(()) => {}
            Err(TradingError::BelowMinNotional { notional, minimum }) => {
                report.below_min_notional += 1;
                self.emit(GridEvent::BelowMinNotional {
                    index: action.index,
                    notional,
                    minimum,
                });
                return Ok(());
            }
            Err(TradingError::ExposureCapped { committed, requested, limit }) => {
                report.exposure_capped += 1;
                self.emit(GridEvent::ExposureCapped {
                    index: action.index,
                    committed,
                    requested,
                    limit,
                });
                return Ok(());
            }
            Err(TradingError::InsufficientFunds { asset, required, available }) => {
                report.unfunded += 1;
                self.emit(GridEvent::InsufficientFunds {
                    index: action.index,
                    asset,
                    required,
                    available,
                });
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        // The client id is persisted before the order leaves, so a crash can be resolved on restart
        let client_order_id = ClientOrderId::generate();
        let index = action.index;
        match action.action {
            DesiredAction::Replace { filled_index, side } => {
                let id = client_order_id.clone();
                self.mutate(|l| l.begin_replacement(filled_index, index, side, id))?;
            }
            DesiredAction::Place(side) | DesiredAction::Retry(side) => {
                let id = client_order_id.clone();
                self.mutate(|l| l.begin_placement(index, side, id, None))?;
            }
        }

        match self
            .gateway
            .place_order_with_id(side, action.price, quantity, client_order_id)
            .await
        {
            Ok(handle) => {
                if let Some(exchange_order_id) = handle.exchange_order_id.as_deref() {
                    self.mutate(|l| l.confirm_open(index, exchange_order_id))?;
                }
                self.reserve(side, action.price, quantity);
                report.placed += 1;
                self.emit(GridEvent::OrderPlaced {
                    index,
                    side,
                    price: action.price,
                    quantity,
                    exchange_order_id: handle.exchange_order_id,
                });
            }
            Err(TradingError::TransientNetwork(reason)) => {
                // Outcome unknown: stays PendingOpen until reconciliation looks it up
                report.failed += 1;
                self.emit(GridEvent::PlacementFailed {
                    index,
                    side,
                    reason: format!("unconfirmed: {}", reason),
                    retryable: true,
                });
            }
            Err(e) => {
                let retryable = e.is_recoverable() || matches!(e, TradingError::ShuttingDown);
                let reason = e.to_string();
                self.mutate(|l| l.mark_failed(index, &reason, retryable))?;
                if !matches!(e, TradingError::ShuttingDown) {
                    report.failed += 1;
                    self.emit(GridEvent::PlacementFailed {
                        index,
                        side,
                        reason,
                        retryable,
                    });
                }
            }
        }
        Ok(())
    }

    /// Minimum notional, the exposure cap for buys, then allocation caps and the last balance view
    fn check_risk(&self, side: OrderSide, price: Decimal, quantity: Decimal) -> TradingResult<()> {
        let notional = price * quantity;
        if notional < self.config.min_notional {
            return Err(TradingError::BelowMinNotional {
                notional,
                minimum: self.config.min_notional,
            });
        }

        let ledger = self.ledger();
        match side {
            OrderSide::Buy => {
                // Resting buys count as if filled
                let committed = ledger.committed_exposure() + ledger.open_buy_quantity();
                if committed + quantity > self.config.max_exposure {
                    return Err(TradingError::ExposureCapped {
                        committed,
                        requested: quantity,
                        limit: self.config.max_exposure,
                    });
                }

                let required = notional;
                if let Some(cap) = self.config.quote_allocation {
                    let locked = ledger.open_buy_notional();
                    if locked + required > cap {
                        return Err(TradingError::InsufficientFunds {
                            asset: self.config.quote_asset.clone(),
                            required,
                            available: (cap - locked).max(Decimal::ZERO),
                        });
                    }
                }
                self.check_balance(&self.config.quote_asset, required)
            }
            OrderSide::Sell => {
                if let Some(cap) = self.config.base_allocation {
                    let locked = ledger.open_sell_quantity();
                    if locked + quantity > cap {
                        return Err(TradingError::InsufficientFunds {
                            asset: self.config.base_asset.clone(),
                            required: quantity,
                            available: (cap - locked).max(Decimal::ZERO),
                        });
                    }
                }
                self.check_balance(&self.config.base_asset, quantity)
            }
        }
    }

    fn check_balance(&self, asset: &str, required: Decimal) -> TradingResult<()> {
        match self.balances.get(asset) {
            Some(balance) if balance.free < required => Err(TradingError::InsufficientFunds {
                asset: asset.to_string(),
                required,
                available: balance.free,
            }),
            _ => Ok(()),
        }
    }

    /// Keep the local balance view honest until the next refresh
    fn reserve(&mut self, side: OrderSide, price: Decimal, quantity: Decimal) {
        let (asset, amount) = match side {
            OrderSide::Buy => (&self.config.quote_asset, price * quantity),
            OrderSide::Sell => (&self.config.base_asset, quantity),
        };
        if let Some(balance) = self.balances.get_mut(asset) {
            balance.free -= amount;
            balance.locked += amount;
        }
    }

    /// Fetch the ticker and balances from the exchange
    pub async fn refresh_market(&mut self) -> TradingResult<Decimal> {
        let price = self.gateway.ticker_price().await?;
        let balances = self.gateway.balances().await?;
        self.balances = balances
            .into_iter()
            .map(|balance| (balance.asset.clone(), balance))
            .collect();
        self.last_price = Some(price);
        Ok(price)
    }

    pub fn balance(&self, asset: &str) -> Option<&Balance> {
        self.balances.get(asset)
    }

    /// Operator action: make non-recoverable failures eligible for placement again
    pub fn retry_failed(&mut self) -> TradingResult<usize> {
        let rearmed = self.mutate(|l| Ok(l.rearm_failed()))?;
        if rearmed > 0 {
            info!("🔁 Re-armed {} failed level(s)", rearmed);
        }
        Ok(rearmed)
    }

    // Drawdown

    /// Quote plus base marked at `price`, from the last balance view
    pub fn account_equity(&self, price: Decimal) -> Option<Decimal> {
        if self.balances.is_empty() {
            return None;
        }
        let total = |asset: &str| {
            self.balances
                .get(asset)
                .map(|balance| balance.free + balance.locked)
                .unwrap_or(Decimal::ZERO)
        };
        Some(total(&self.config.quote_asset) + total(&self.config.base_asset) * price)
    }

    /// Compare account equity with its peak. Above the pause limit new buys
    /// are held back; above the kill limit resting buys are cancelled and
    /// placement stops until `reset_kill_switch`.
    pub async fn evaluate_drawdown(&mut self, price: Decimal) -> TradingResult<RiskGate> {
        if self.ledger().kill_switch().is_some() {
            self.gate = RiskGate::Killed;
            return Ok(self.gate);
        }
        let (pause, kill) = (self.config.drawdown_pause_frac, self.config.kill_switch_frac);
        if pause.is_none() && kill.is_none() {
            return Ok(self.gate);
        }
        let Some(equity) = self.account_equity(price) else {
            return Ok(self.gate);
        };

        let drawdown = self.mutate(|l| Ok(l.record_equity(equity)))?;

        if let Some(limit) = kill.filter(|limit| drawdown > *limit) {
            self.mutate(|l| {
                l.trip_kill_switch(drawdown);
                Ok(())
            })?;
            self.gate = RiskGate::Killed;
            let cancelled = self.cancel_where(|level| level.side == Some(OrderSide::Buy)).await?;
            self.emit(GridEvent::KillSwitchTripped {
                drawdown,
                limit,
                cancelled,
            });
            return Ok(self.gate);
        }

        let paused = pause.filter(|limit| drawdown > *limit);
        match (paused, self.gate) {
            (Some(limit), RiskGate::Clear) => {
                self.gate = RiskGate::Paused;
                self.emit(GridEvent::DrawdownPaused { drawdown, limit });
            }
            (None, RiskGate::Paused) => {
                self.gate = RiskGate::Clear;
                self.emit(GridEvent::DrawdownResumed { drawdown });
            }
            _ => {}
        }
        Ok(self.gate)
    }

    /// Operator action: lift a latched kill switch
    pub fn reset_kill_switch(&mut self) -> TradingResult<bool> {
        let reset = self.mutate(|l| Ok(l.reset_kill_switch()))?;
        if reset {
            self.gate = RiskGate::Clear;
            self.emit(GridEvent::KillSwitchReset);
        }
        Ok(reset)
    }

    // Re-centering

    /// Re-center when the price left the window by more than the threshold
    pub async fn maybe_recenter(&mut self, price: Decimal) -> TradingResult<bool> {
        let layout = self.ledger().layout();
        let lower = layout.lower_bound();
        let upper = layout.upper_bound();
        let threshold = self.config.rebalance_threshold;

        let outside = price > upper + threshold.distance_from(upper) || price < lower - threshold.distance_from(lower);
        if !outside {
            return Ok(false);
        }
        info!("📐 Price {} left the grid {} .. {}, re-centering", price, lower, upper);
        self.recenter(price).await
    }

    /// Shift the window so `price` sits in the middle. Orders outside the new
    /// window are cancelled on a scratch copy; the copy replaces the ledger
    /// only once every cancel is confirmed, otherwise the ledger is untouched.
    pub async fn recenter(&mut self, price: Decimal) -> TradingResult<bool> {
        if self.gateway.shutdown().is_shutting_down() || self.halted {
            return Ok(false);
        }

        let shift = self.ledger().layout().shift_to_center(price);
        if shift == 0 {
            return Ok(false);
        }
        let target = self.ledger().layout().shifted(shift);

        let mut scratch = self.ledger().clone();
        let mut outstanding: Vec<i64> = scratch
            .levels()
            .filter(|level| !target.contains(level.index) && level.state.is_live())
            .map(|level| level.index)
            .collect();
        let mut cancelled = Vec::new();

        for round in 0..self.config.recenter_max_rounds.max(1) {
            let mut unconfirmed = Vec::new();
            for index in outstanding {
                let handle = match scratch.level(index).and_then(|level| level.handle()) {
                    Some(handle) => handle,
                    None => {
                        scratch.retire_level(index);
                        continue;
                    }
                };
                match self.gateway.cancel_order(&handle).await {
                    Ok(()) | Err(TradingError::NotFound(_)) => {
                        scratch.retire_level(index);
                        cancelled.push((index, handle.exchange_order_id));
                    }
                    Err(e) => {
                        warn!("⚠️  Cancel of level {} failed in round {}: {}", index, round + 1, e);
                        unconfirmed.push(index);
                    }
                }
            }
            outstanding = unconfirmed;
            if outstanding.is_empty() {
                break;
            }
        }

        if !outstanding.is_empty() {
            self.emit(GridEvent::RecenterAborted {
                unconfirmed: outstanding.len(),
            });
            return Ok(false);
        }

        scratch.shift_window(shift)?;
        self.commit(scratch)?;

        for (index, exchange_order_id) in cancelled {
            self.emit(GridEvent::OrderCancelled { index, exchange_order_id });
        }
        let layout = self.ledger().layout();
        self.emit(GridEvent::Recentered {
            shift,
            lower: layout.lower_bound(),
            upper: layout.upper_bound(),
        });
        Ok(true)
    }

    // Shutdown

    /// Refuse new placements from now on
    pub fn stop_placing(&self) {
        if !self.gateway.shutdown().is_shutting_down() {
            self.gateway.shutdown().initiate_shutdown();
            self.emit(GridEvent::ShutdownStarted);
        }
    }

    /// Cancel every live order of the grid. Returns how many were confirmed.
    pub async fn cancel_all(&mut self) -> TradingResult<usize> {
        self.cancel_where(|_| true).await
    }

    /// Cancel the live orders of levels matching `filter`, retiring each confirmed one
    async fn cancel_where<F>(&mut self, filter: F) -> TradingResult<usize>
    where
        F: Fn(&GridLevel) -> bool,
    {
        let live: Vec<i64> = self
            .ledger()
            .levels()
            .filter(|level| level.state.is_live() && filter(level))
            .map(|level| level.index)
            .collect();

        let mut confirmed = 0;
        for index in live {
            let handle = match self.mutate(|l| l.begin_cancel(index)) {
                Ok(handle) => handle,
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => {
                    self.mutate(|l| Ok(l.retire_level(index)))?;
                    continue;
                }
            };
            match self.gateway.cancel_order(&handle).await {
                Ok(()) | Err(TradingError::NotFound(_)) => {
                    self.mutate(|l| Ok(l.retire_level(index)))?;
                    self.emit(GridEvent::OrderCancelled {
                        index,
                        exchange_order_id: handle.exchange_order_id,
                    });
                    confirmed += 1;
                }
                Err(e) => warn!("⚠️  Cancel of level {} unconfirmed, resolved on next start: {}", index, e),
            }
        }
        Ok(confirmed)
    }

    pub(crate) fn finish_shutdown(&self) {
        let ledger = self.ledger();
        self.emit(GridEvent::ShutdownComplete {
            position: ledger.position(),
            realized_pnl: ledger.realized_pnl(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::paper::PaperExchange;
    use crate::config::GatewayConfig;
    use crate::core::error_handling::{GracefulShutdown, RetryPolicy};
    use crate::core::events::RecordingSink;
    use crate::db::InMemorySnapshotStore;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn engine_at(price: Decimal) -> (GridEngine, Arc<PaperExchange>, Arc<RecordingSink>) {
        let config = GridConfig::arithmetic("BTCUSDT", dec!(90), dec!(110), dec!(2), dec!(1)).with_max_exposure(dec!(5));
        let paper = Arc::new(PaperExchange::new("BTCUSDT", price));
        let gateway = ExchangeGateway::new(paper.clone(), "BTCUSDT", &GatewayConfig::default(), GracefulShutdown::new())
            .with_retry_policy(RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(2), 2.0));
        let sink = Arc::new(RecordingSink::new());
        let engine = GridEngine::new(
            config,
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(gateway),
            sink.clone(),
        )
        .unwrap();
        (engine, paper, sink)
    }

    #[tokio::test]
    async fn test_sync_leaves_gap_at_price() {
        let (mut engine, paper, _) = engine_at(dec!(100));
        let report = engine.sync_orders(dec!(100)).await.unwrap();

        assert_eq!(report.placed, 10);
        assert_eq!(paper.live_orders().len(), 10);
        assert_eq!(engine.ledger().level(5).unwrap().state, LevelState::Empty);
        assert_eq!(engine.ledger().level(4).unwrap().side, Some(OrderSide::Buy));
        assert_eq!(engine.ledger().level(6).unwrap().side, Some(OrderSide::Sell));
    }

    #[tokio::test]
    async fn test_exposure_cap_blocks_buys() {
        let (mut engine, _, sink) = engine_at(dec!(100));
        engine.config.max_exposure = dec!(0.5);
        let report = engine.sync_orders(dec!(100)).await.unwrap();

        assert_eq!(report.exposure_capped, 5);
        assert_eq!(report.placed, 5);
        assert_eq!(sink.count(|e| matches!(e, GridEvent::ExposureCapped { .. })), 5);
    }

    #[tokio::test]
    async fn test_status_reflects_ledger() {
        let (mut engine, _, _) = engine_at(dec!(100));
        engine.sync_orders(dec!(100)).await.unwrap();
        let status = engine.status();
        assert_eq!(status.levels, 11);
        assert_eq!(status.open_orders, 10);
        assert_eq!(status.last_price, Some(dec!(100)));
        assert!(!status.halted);
    }
}
