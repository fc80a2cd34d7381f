// Grid ledger: one order slot per level, position and P&L, write-through persistence

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::GridConfig;
use crate::core::layout::{floor_to_step, GridLayout};
use crate::core::types::{
    ClientOrderId, FillEvent, FillKey, LevelState, OrderHandle, OrderSide, PlacementFailure,
};
use crate::db::SnapshotStore;
use crate::error::{TradingError, TradingResult};

/// Format version written into every snapshot
pub const SNAPSHOT_VERSION: u32 = 1;

/// Fill keys remembered for duplicate detection
const SEEN_FILL_CAPACITY: usize = 4096;

/// Orders remembered with synthesized-but-unreported fill quantity
const SYNTHETIC_CREDIT_CAPACITY: usize = 1024;

/// A price point of the ladder and the single order slot it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: i64,
    pub price: Decimal,
    /// Side of the current order, None while the slot has never been used
    pub side: Option<OrderSide>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    /// Sum of fill price * fill quantity, for the average fill price
    pub fill_notional: Decimal,
    pub state: LevelState,
    pub exchange_order_id: Option<String>,
    pub client_order_id: Option<ClientOrderId>,
    /// Cost basis carried by a replacement order
    pub entry_price: Option<Decimal>,
    pub failure: Option<PlacementFailure>,
    pub updated_at: DateTime<Utc>,
}

impl GridLevel {
    fn empty(index: i64, price: Decimal) -> Self {
        Self {
            index,
            price,
            side: None,
            quantity: Decimal::ZERO,
            filled_quantity: Decimal::ZERO,
            fill_notional: Decimal::ZERO,
            state: LevelState::Empty,
            exchange_order_id: None,
            client_order_id: None,
            entry_price: None,
            failure: None,
            updated_at: Utc::now(),
        }
    }

    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    pub fn average_fill_price(&self) -> Option<Decimal> {
        if self.filled_quantity.is_zero() {
            None
        } else {
            Some(self.fill_notional / self.filled_quantity)
        }
    }

    /// Slot can take a new order
    pub fn is_free(&self) -> bool {
        matches!(self.state, LevelState::Empty | LevelState::Failed)
    }

    pub fn handle(&self) -> Option<OrderHandle> {
        self.client_order_id.as_ref().map(|client_order_id| OrderHandle {
            client_order_id: client_order_id.clone(),
            exchange_order_id: self.exchange_order_id.clone(),
        })
    }

    fn clear(&mut self) {
        *self = Self::empty(self.index, self.price);
    }
}

/// Order cancelled out of the window whose late fills still move the position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetiredOrder {
    pub side: OrderSide,
    pub price: Decimal,
    pub remaining: Decimal,
    pub entry_price: Option<Decimal>,
    pub retired_at: DateTime<Utc>,
}

/// Latched when account drawdown crossed the kill limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitch {
    pub drawdown: Decimal,
    pub tripped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// Already applied, nothing changed
    Duplicate,
    /// Covered by quantity reconciliation synthesized earlier
    Absorbed { exchange_order_id: String },
    Partial {
        index: i64,
        side: OrderSide,
        quantity: Decimal,
        remaining: Decimal,
    },
    Completed {
        index: i64,
        side: OrderSide,
        quantity: Decimal,
        average_price: Decimal,
        /// Level that owes the mirrored order, None when it falls outside the window
        replacement: Option<i64>,
    },
    /// Fill on an order that was cancelled out of the window
    Retired { side: OrderSide, quantity: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredAction {
    /// Fresh order on an empty level
    Place(OrderSide),
    /// Mirrored order for the fill recorded on `filled_index`
    Replace { filled_index: i64, side: OrderSide },
    /// Resubmit a level whose placement failed with a recoverable error
    Retry(OrderSide),
}

impl DesiredAction {
    pub fn side(&self) -> OrderSide {
        match self {
            DesiredAction::Place(side) | DesiredAction::Retry(side) => *side,
            DesiredAction::Replace { side, .. } => *side,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelAction {
    pub index: i64,
    pub price: Decimal,
    pub action: DesiredAction,
}

/// Ordered set of grid levels for one session plus everything derived from fills
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLedger {
    session_id: String,
    symbol: String,
    layout: GridLayout,
    quantity_per_level: Decimal,
    qty_step: Decimal,
    max_open_orders: usize,
    levels: BTreeMap<i64, GridLevel>,
    /// Base quantity from filled buys minus filled sells
    position: Decimal,
    realized_pnl: Decimal,
    fill_count: u64,
    seen_fills: VecDeque<FillKey>,
    synthetic_credit: VecDeque<(String, Decimal)>,
    retired: BTreeMap<String, RetiredOrder>,
    /// Highest account equity seen while a drawdown limit is configured
    #[serde(default)]
    peak_equity: Option<Decimal>,
    #[serde(default)]
    kill_switch: Option<KillSwitch>,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GridLedger {
    /// Fresh ledger with every level empty
    pub fn new(config: &GridConfig) -> Self {
        let layout = config.layout();
        let levels = layout
            .indices()
            .filter_map(|index| layout.price_at(index).map(|price| (index, GridLevel::empty(index, price))))
            .collect();
        let now = Utc::now();

        Self {
            session_id: config.session_id.clone(),
            symbol: config.symbol.clone(),
            layout,
            quantity_per_level: config.quantity_per_level,
            qty_step: config.qty_step,
            max_open_orders: config.max_open_orders,
            levels,
            position: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            fill_count: 0,
            seen_fills: VecDeque::new(),
            synthetic_credit: VecDeque::new(),
            retired: BTreeMap::new(),
            peak_equity: None,
            kill_switch: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refuse a persisted ledger that was built from a different grid
    pub fn check_config(&self, config: &GridConfig) -> TradingResult<()> {
        if self.session_id != config.session_id || self.symbol != config.symbol {
            return Err(TradingError::ConfigurationInvalid(format!(
                "persisted session {} ({}) does not belong to {} ({})",
                self.session_id, self.symbol, config.session_id, config.symbol
            )));
        }

        let expected = config.layout().shifted(self.layout.first_index());
        if expected != self.layout {
            return Err(TradingError::ConfigurationInvalid(format!(
                "persisted grid layout for session {} differs from the configured bounds or spacing",
                self.session_id
            )));
        }

        if self.quantity_per_level != config.quantity_per_level {
            return Err(TradingError::ConfigurationInvalid(format!(
                "persisted quantity_per_level {} differs from configured {}",
                self.quantity_per_level, config.quantity_per_level
            )));
        }

        Ok(())
    }

    // Accessors

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn level(&self, index: i64) -> Option<&GridLevel> {
        self.levels.get(&index)
    }

    pub fn levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.values()
    }

    pub fn position(&self) -> Decimal {
        self.position
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn fill_count(&self) -> u64 {
        self.fill_count
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn retired_orders(&self) -> &BTreeMap<String, RetiredOrder> {
        &self.retired
    }

    /// Quantity each new order is sized to
    pub fn order_quantity(&self) -> Decimal {
        floor_to_step(self.quantity_per_level, self.qty_step)
    }

    /// Filled-but-unhedged base quantity
    pub fn committed_exposure(&self) -> Decimal {
        self.position.max(Decimal::ZERO)
    }

    pub fn live_order_count(&self) -> usize {
        self.levels.values().filter(|level| level.state.is_live()).count()
    }

    pub fn count_in_state(&self, state: LevelState) -> usize {
        self.levels.values().filter(|level| level.state == state).count()
    }

    /// Base quantity the live buys would add to the position if they all filled
    pub fn open_buy_quantity(&self) -> Decimal {
        self.levels
            .values()
            .filter(|level| level.state.is_live() && level.side == Some(OrderSide::Buy))
            .map(|level| level.remaining())
            .sum()
    }

    /// Quote notional still locked by live buys
    pub fn open_buy_notional(&self) -> Decimal {
        self.levels
            .values()
            .filter(|level| level.state.is_live() && level.side == Some(OrderSide::Buy))
            .map(|level| level.price * level.remaining())
            .sum()
    }

    /// Base quantity still locked by live sells
    pub fn open_sell_quantity(&self) -> Decimal {
        self.levels
            .values()
            .filter(|level| level.state.is_live() && level.side == Some(OrderSide::Sell))
            .map(|level| level.remaining())
            .sum()
    }

    /// Mark-to-market P&L of live replacement orders against their cost basis
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.levels
            .values()
            .filter(|level| level.state.is_live())
            .filter_map(|level| {
                let entry = level.entry_price?;
                let remaining = level.remaining();
                match level.side? {
                    OrderSide::Sell => Some((price - entry) * remaining),
                    OrderSide::Buy => Some((entry - price) * remaining),
                }
            })
            .sum()
    }

    pub fn index_for_order(&self, exchange_order_id: &str) -> Option<i64> {
        self.levels
            .values()
            .find(|level| level.exchange_order_id.as_deref() == Some(exchange_order_id))
            .map(|level| level.index)
    }

    /// Level that stays empty: the one nearest the current price
    pub fn gap_index(&self, price: Decimal) -> i64 {
        self.layout
            .nearest_index(price)
            .clamp(self.layout.first_index(), self.layout.last_index())
    }

    // Fills

    /// Apply one execution. Applying the same event twice changes the ledger once.
    pub fn apply_fill(&mut self, event: &FillEvent) -> TradingResult<FillOutcome> {
        let key = event.key();
        if self.seen_fills.contains(&key) {
            return Ok(FillOutcome::Duplicate);
        }

        if event.quantity <= Decimal::ZERO && event.cumulative_quantity.is_none() {
            return Err(TradingError::Drift(format!(
                "fill for order {} carries non-positive quantity {}",
                event.exchange_order_id, event.quantity
            )));
        }

        let mut quantity = event.quantity;
        if !event.synthetic && event.cumulative_quantity.is_none() {
            quantity = self.absorb_synthetic(&event.exchange_order_id, quantity);
            if quantity.is_zero() {
                self.remember(key);
                return Ok(FillOutcome::Absorbed {
                    exchange_order_id: event.exchange_order_id.clone(),
                });
            }
        }

        if let Some(index) = self.index_for_order(&event.exchange_order_id) {
            let outcome = self.fill_level(index, quantity, event)?;
            if outcome != FillOutcome::Duplicate {
                self.remember(key);
            }
            return Ok(outcome);
        }

        if let Some(retired) = self.retired.get_mut(&event.exchange_order_id) {
            let quantity = quantity.min(retired.remaining);
            if quantity.is_zero() {
                return Ok(FillOutcome::Duplicate);
            }
            retired.remaining -= quantity;
            let side = retired.side;
            let entry = retired.entry_price;
            if retired.remaining.is_zero() {
                self.retired.remove(&event.exchange_order_id);
            }
            self.book_fill(side, quantity, event.price, entry);
            if event.synthetic {
                self.add_synthetic_credit(&event.exchange_order_id, quantity);
            }
            self.remember(key);
            return Ok(FillOutcome::Retired { side, quantity });
        }

        Err(TradingError::UnknownOrder(event.exchange_order_id.clone()))
    }

    fn fill_level(&mut self, index: i64, quantity: Decimal, event: &FillEvent) -> TradingResult<FillOutcome> {
        let level = self
            .levels
            .get_mut(&index)
            .ok_or_else(|| TradingError::Internal(format!("level {} vanished", index)))?;
        let side = level
            .side
            .ok_or_else(|| TradingError::Internal(format!("level {} has an order without a side", index)))?;

        let mut quantity = match event.cumulative_quantity {
            Some(cumulative) => cumulative - level.filled_quantity,
            None => quantity,
        };
        quantity = quantity.min(level.remaining());
        if quantity <= Decimal::ZERO {
            return Ok(FillOutcome::Duplicate);
        }

        level.filled_quantity += quantity;
        level.fill_notional += quantity * event.price;
        level.updated_at = Utc::now();
        if level.state == LevelState::PendingOpen {
            level.state = LevelState::Open;
        }
        let entry = level.entry_price;
        let remaining = level.remaining();

        let outcome = if remaining.is_zero() {
            level.state = LevelState::Filled;
            let average_price = level.average_fill_price().unwrap_or(event.price);
            let target = index + side.replacement_offset();
            let replacement = if self.layout.contains(target) {
                Some(target)
            } else {
                level.clear();
                None
            };
            FillOutcome::Completed {
                index,
                side,
                quantity,
                average_price,
                replacement,
            }
        } else {
            FillOutcome::Partial {
                index,
                side,
                quantity,
                remaining,
            }
        };

        self.book_fill(side, quantity, event.price, entry);
        if event.synthetic {
            self.add_synthetic_credit(&event.exchange_order_id, quantity);
        }
        Ok(outcome)
    }

    fn book_fill(&mut self, side: OrderSide, quantity: Decimal, price: Decimal, entry: Option<Decimal>) {
        match side {
            OrderSide::Buy => self.position += quantity,
            OrderSide::Sell => self.position -= quantity,
        }
        if let Some(entry) = entry {
            self.realized_pnl += match side {
                OrderSide::Sell => (price - entry) * quantity,
                OrderSide::Buy => (entry - price) * quantity,
            };
        }
        self.fill_count += 1;
    }

    fn remember(&mut self, key: FillKey) {
        if self.seen_fills.len() >= SEEN_FILL_CAPACITY {
            self.seen_fills.pop_front();
        }
        self.seen_fills.push_back(key);
    }

    fn add_synthetic_credit(&mut self, exchange_order_id: &str, quantity: Decimal) {
        if let Some(entry) = self.synthetic_credit.iter_mut().find(|(id, _)| id == exchange_order_id) {
            entry.1 += quantity;
            return;
        }
        if self.synthetic_credit.len() >= SYNTHETIC_CREDIT_CAPACITY {
            self.synthetic_credit.pop_front();
        }
        self.synthetic_credit.push_back((exchange_order_id.to_string(), quantity));
    }

    /// Consume synthesized quantity that a late exchange report now covers
    fn absorb_synthetic(&mut self, exchange_order_id: &str, quantity: Decimal) -> Decimal {
        let Some(pos) = self.synthetic_credit.iter().position(|(id, _)| id == exchange_order_id) else {
            return quantity;
        };
        let credit = self.synthetic_credit[pos].1;
        let absorbed = credit.min(quantity);
        if credit - absorbed <= Decimal::ZERO {
            self.synthetic_credit.remove(pos);
        } else {
            self.synthetic_credit[pos].1 = credit - absorbed;
        }
        debug!("Absorbed {} of reported fill on {} against synthesized quantity", absorbed, exchange_order_id);
        quantity - absorbed
    }

    // Desired actions

    /// Orders the grid is missing at `current_price`, nearest first, within the open order budget
    pub fn levels_needing_action(&self, current_price: Decimal) -> Vec<LevelAction> {
        let cap = self
            .max_open_orders
            .min(self.layout.level_count().saturating_sub(1));
        let budget = cap.saturating_sub(self.live_order_count());
        if budget == 0 {
            return Vec::new();
        }

        let gap = self.gap_index(current_price);
        let mut claimed = HashSet::new();
        let mut actions = Vec::new();

        // Replacements owed by filled levels
        for level in self.levels.values().filter(|l| l.state == LevelState::Filled) {
            let Some(side) = level.side else { continue };
            let target = level.index + side.replacement_offset();
            if let Some(slot) = self.levels.get(&target) {
                if slot.is_free() && claimed.insert(target) {
                    actions.push(LevelAction {
                        index: target,
                        price: slot.price,
                        action: DesiredAction::Replace {
                            filled_index: level.index,
                            side: side.opposite(),
                        },
                    });
                }
            }
        }

        for level in self.levels.values() {
            if claimed.contains(&level.index) {
                continue;
            }
            let action = match level.state {
                LevelState::Failed => match (&level.failure, level.side) {
                    (Some(failure), Some(side)) if failure.retryable => DesiredAction::Retry(side),
                    _ => continue,
                },
                LevelState::Empty if level.index != gap => {
                    if level.price < current_price {
                        DesiredAction::Place(OrderSide::Buy)
                    } else if level.price > current_price {
                        DesiredAction::Place(OrderSide::Sell)
                    } else {
                        continue;
                    }
                }
                _ => continue,
            };
            actions.push(LevelAction {
                index: level.index,
                price: level.price,
                action,
            });
        }

        actions.sort_by_key(|action| (action.price - current_price).abs());
        actions.truncate(budget);
        actions
    }

    // Order slot transitions

    /// Reserve a free level for a new order before it is submitted
    pub fn begin_placement(
        &mut self,
        index: i64,
        side: OrderSide,
        client_order_id: ClientOrderId,
        entry_price: Option<Decimal>,
    ) -> TradingResult<()> {
        let quantity = self.order_quantity();
        let level = self.free_level_mut(index)?;
        let entry_price = match (entry_price, level.state) {
            (Some(entry), _) => Some(entry),
            (None, LevelState::Failed) => level.entry_price,
            (None, _) => None,
        };

        level.clear();
        level.side = Some(side);
        level.quantity = quantity;
        level.client_order_id = Some(client_order_id);
        level.entry_price = entry_price;
        level.state = LevelState::PendingOpen;
        Ok(())
    }

    /// Move the replacement owed by a filled level onto its target and free the filled slot
    pub fn begin_replacement(
        &mut self,
        filled_index: i64,
        target: i64,
        side: OrderSide,
        client_order_id: ClientOrderId,
    ) -> TradingResult<()> {
        let filled = self
            .levels
            .get(&filled_index)
            .ok_or_else(|| TradingError::Internal(format!("no level {}", filled_index)))?;
        if filled.state != LevelState::Filled {
            return Err(TradingError::Internal(format!(
                "level {} owes no replacement (state {:?})",
                filled_index, filled.state
            )));
        }
        let entry = filled.average_fill_price().unwrap_or(filled.price);

        self.begin_placement(target, side, client_order_id, Some(entry))?;
        if let Some(level) = self.levels.get_mut(&filled_index) {
            level.clear();
        }
        Ok(())
    }

    pub fn confirm_open(&mut self, index: i64, exchange_order_id: &str) -> TradingResult<()> {
        let level = self.level_mut(index)?;
        match level.state {
            LevelState::PendingOpen | LevelState::Open => {
                level.state = LevelState::Open;
                level.exchange_order_id = Some(exchange_order_id.to_string());
                level.failure = None;
                level.updated_at = Utc::now();
                Ok(())
            }
            other => Err(TradingError::Internal(format!(
                "cannot acknowledge order on level {} in state {:?}",
                index, other
            ))),
        }
    }

    pub fn mark_failed(&mut self, index: i64, reason: &str, retryable: bool) -> TradingResult<()> {
        let level = self.level_mut(index)?;
        level.state = LevelState::Failed;
        level.exchange_order_id = None;
        level.quantity = Decimal::ZERO;
        level.filled_quantity = Decimal::ZERO;
        level.fill_notional = Decimal::ZERO;
        level.failure = Some(PlacementFailure {
            reason: reason.to_string(),
            retryable,
            failed_at: Utc::now(),
        });
        level.updated_at = Utc::now();
        Ok(())
    }

    pub fn begin_cancel(&mut self, index: i64) -> TradingResult<OrderHandle> {
        let level = self.level_mut(index)?;
        if !matches!(level.state, LevelState::Open | LevelState::PendingOpen | LevelState::PendingCancel) {
            return Err(TradingError::Internal(format!(
                "level {} has no live order to cancel (state {:?})",
                index, level.state
            )));
        }
        let handle = level
            .handle()
            .ok_or_else(|| TradingError::Internal(format!("level {} has no client order id", index)))?;
        level.state = LevelState::PendingCancel;
        level.updated_at = Utc::now();
        Ok(handle)
    }

    /// Drop the level's order from the ledger, keeping it as retired while fills may still arrive
    pub fn retire_level(&mut self, index: i64) -> Option<RetiredOrder> {
        let level = self.levels.get_mut(&index)?;
        let retired = match (level.state.is_live(), level.exchange_order_id.clone(), level.side) {
            (true, Some(order_id), Some(side)) if !level.remaining().is_zero() => {
                let retired = RetiredOrder {
                    side,
                    price: level.price,
                    remaining: level.remaining(),
                    entry_price: level.entry_price,
                    retired_at: Utc::now(),
                };
                self.retired.insert(order_id, retired.clone());
                Some(retired)
            }
            _ => None,
        };
        if let Some(level) = self.levels.get_mut(&index) {
            level.clear();
        }
        retired
    }

    /// Retired order confirmed finished on the exchange
    pub fn forget_retired(&mut self, exchange_order_id: &str) -> bool {
        self.retired.remove(exchange_order_id).is_some()
    }

    // Drawdown

    pub fn peak_equity(&self) -> Option<Decimal> {
        self.peak_equity
    }

    pub fn kill_switch(&self) -> Option<&KillSwitch> {
        self.kill_switch.as_ref()
    }

    /// Track the equity peak and return the drawdown from it as a fraction
    pub fn record_equity(&mut self, equity: Decimal) -> Decimal {
        let peak = match self.peak_equity {
            Some(peak) if peak >= equity => peak,
            _ => {
                self.peak_equity = Some(equity);
                equity
            }
        };
        if peak <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((peak - equity) / peak).max(Decimal::ZERO)
    }

    pub fn trip_kill_switch(&mut self, drawdown: Decimal) {
        if self.kill_switch.is_none() {
            self.kill_switch = Some(KillSwitch {
                drawdown,
                tripped_at: Utc::now(),
            });
        }
    }

    /// Clear the kill switch; the equity peak restarts from the next observation
    pub fn reset_kill_switch(&mut self) -> bool {
        self.peak_equity = None;
        self.kill_switch.take().is_some()
    }

    /// Drop retired orders older than `cutoff`; their late fills would have arrived by now
    pub fn prune_retired(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.retired.len();
        self.retired.retain(|_, retired| retired.retired_at >= cutoff);
        before - self.retired.len()
    }

    /// Resolve filled levels whose mirrored slot is already taken care of.
    ///
    /// A live order of the replacement's side on the target counts as the
    /// replacement and inherits the cost basis. Two adjacent filled levels
    /// owing each other form a completed round trip and are both freed.
    pub fn settle_covered_replacements(&mut self) -> usize {
        let filled: Vec<(i64, OrderSide)> = self
            .levels
            .values()
            .filter(|level| level.state == LevelState::Filled)
            .filter_map(|level| level.side.map(|side| (level.index, side)))
            .collect();

        let mut settled = 0;
        for (index, side) in filled {
            let Some(level) = self.levels.get(&index) else { continue };
            if level.state != LevelState::Filled {
                continue;
            }
            let entry = level.average_fill_price().unwrap_or(level.price);
            let own_entry = level.entry_price;
            let quantity = level.filled_quantity;
            let target_index = index + side.replacement_offset();
            let Some(target) = self.levels.get(&target_index) else { continue };

            if target.state.is_live() && target.side == Some(side.opposite()) {
                if let Some(target) = self.levels.get_mut(&target_index) {
                    target.entry_price.get_or_insert(entry);
                }
            } else if target.state == LevelState::Filled && target.side == Some(side.opposite()) {
                let other_entry = target.average_fill_price().unwrap_or(target.price);
                if own_entry.is_none() && target.entry_price.is_none() {
                    let paired = quantity.min(target.filled_quantity);
                    let (buy, sell) = match side {
                        OrderSide::Buy => (entry, other_entry),
                        OrderSide::Sell => (other_entry, entry),
                    };
                    self.realized_pnl += (sell - buy) * paired;
                }
                if let Some(target) = self.levels.get_mut(&target_index) {
                    target.clear();
                }
            } else {
                continue;
            }

            if let Some(level) = self.levels.get_mut(&index) {
                level.clear();
            }
            settled += 1;
        }
        settled
    }

    /// Move the window by whole levels; levels inside both windows keep their orders
    pub fn shift_window(&mut self, by: i64) -> TradingResult<()> {
        let layout = self.layout.shifted(by);

        if let Some(level) = self
            .levels
            .values()
            .find(|level| !layout.contains(level.index) && level.state.is_live())
        {
            return Err(TradingError::Internal(format!(
                "level {} still holds a live order outside the new window",
                level.index
            )));
        }

        self.levels.retain(|index, _| layout.contains(*index));

        for level in self.levels.values_mut() {
            if level.state == LevelState::Filled {
                let owes_into_window = level
                    .side
                    .map(|side| layout.contains(level.index + side.replacement_offset()))
                    .unwrap_or(false);
                if !owes_into_window {
                    level.clear();
                }
            }
        }

        for index in layout.indices() {
            if !self.levels.contains_key(&index) {
                let price = layout.price_at(index).ok_or_else(|| {
                    TradingError::ConfigurationInvalid(format!("level {} has no positive price", index))
                })?;
                self.levels.insert(index, GridLevel::empty(index, price));
            }
        }

        self.layout = layout;
        Ok(())
    }

    /// Re-arm levels whose placement failed with a non-recoverable error
    pub fn rearm_failed(&mut self) -> usize {
        let mut count = 0;
        for level in self.levels.values_mut() {
            if let Some(failure) = level.failure.as_mut() {
                if level.state == LevelState::Failed && !failure.retryable {
                    failure.retryable = true;
                    count += 1;
                }
            }
        }
        count
    }

    fn level_mut(&mut self, index: i64) -> TradingResult<&mut GridLevel> {
        self.levels
            .get_mut(&index)
            .ok_or_else(|| TradingError::Internal(format!("no level {}", index)))
    }

    fn free_level_mut(&mut self, index: i64) -> TradingResult<&mut GridLevel> {
        let level = self.level_mut(index)?;
        if !level.is_free() {
            return Err(TradingError::Internal(format!(
                "level {} is occupied (state {:?})",
                index, level.state
            )));
        }
        Ok(level)
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.updated_at = Utc::now();
    }

    // Snapshots

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            version: SNAPSHOT_VERSION,
            session_id: self.session_id.clone(),
            revision: self.revision,
            saved_at: Utc::now(),
            ledger: self.clone(),
        }
    }

    pub fn restore(snapshot: LedgerSnapshot) -> TradingResult<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(TradingError::PersistenceFailure(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        if snapshot.session_id != snapshot.ledger.session_id {
            return Err(TradingError::PersistenceFailure(format!(
                "snapshot key {} does not match ledger session {}",
                snapshot.session_id, snapshot.ledger.session_id
            )));
        }
        Ok(snapshot.ledger)
    }
}

/// Serialized ledger as written to a snapshot store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: u32,
    pub session_id: String,
    pub revision: u64,
    pub saved_at: DateTime<Utc>,
    pub ledger: GridLedger,
}

impl LedgerSnapshot {
    pub fn to_json(&self) -> TradingResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TradingError::PersistenceFailure(format!("failed to encode snapshot: {}", e)))
    }

    pub fn from_json(json: &str) -> TradingResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| TradingError::PersistenceFailure(format!("failed to decode snapshot: {}", e)))
    }
}

/// Ledger whose every mutation is flushed to a snapshot store before it becomes visible
pub struct PersistentLedger {
    ledger: GridLedger,
    store: Arc<dyn SnapshotStore>,
}

impl PersistentLedger {
    /// Resume the session's ledger or create it from config. Returns whether a snapshot was resumed.
    pub fn open(config: &GridConfig, store: Arc<dyn SnapshotStore>) -> TradingResult<(Self, bool)> {
        match store.load(&config.session_id)? {
            Some(snapshot) => {
                let ledger = GridLedger::restore(snapshot)?;
                ledger.check_config(config)?;
                info!(
                    "📂 Resumed ledger for session {} (revision {}, position {})",
                    ledger.session_id, ledger.revision, ledger.position
                );
                Ok((Self { ledger, store }, true))
            }
            None => {
                let ledger = GridLedger::new(config);
                store.save(&ledger.session_id, &ledger.snapshot())?;
                info!(
                    "🆕 Created ledger for session {} with {} levels",
                    ledger.session_id,
                    ledger.layout.level_count()
                );
                Ok((Self { ledger, store }, false))
            }
        }
    }

    pub fn ledger(&self) -> &GridLedger {
        &self.ledger
    }

    /// Apply `f` and flush. On any failure the in-memory ledger is rolled back.
    pub fn mutate<T, F>(&mut self, f: F) -> TradingResult<T>
    where
        F: FnOnce(&mut GridLedger) -> TradingResult<T>,
    {
        let previous = self.ledger.clone();

        let value = match f(&mut self.ledger) {
            Ok(value) => value,
            Err(e) => {
                self.ledger = previous;
                return Err(e);
            }
        };

        if self.ledger == previous {
            return Ok(value);
        }

        self.ledger.touch();
        if let Err(e) = self.store.save(&self.ledger.session_id, &self.ledger.snapshot()) {
            warn!("💾 Snapshot write failed, rolling back revision {}: {}", self.ledger.revision, e);
            self.ledger = previous;
            return Err(TradingError::PersistenceFailure(e.to_string()));
        }
        Ok(value)
    }

    /// Replace the whole ledger, e.g. with a re-centered copy
    pub fn commit(&mut self, next: GridLedger) -> TradingResult<()> {
        self.mutate(move |ledger| {
            *ledger = next;
            Ok(())
        })
    }

    /// Write the current state regardless of changes
    pub fn flush(&mut self) -> TradingResult<()> {
        self.store
            .save(&self.ledger.session_id, &self.ledger.snapshot())
            .map_err(|e| TradingError::PersistenceFailure(e.to_string()))
    }
}
