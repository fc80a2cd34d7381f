// In-process paper exchange: limit order book against a simulated or scripted price

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::clients::gateway::{ExchangeApi, TradeRecord};
use crate::config::split_symbol;
use crate::core::layout::round_to_tick;
use crate::core::types::{
    Balance, ClientOrderId, FillEvent, LiveOrder, OrderHandle, OrderRequest, OrderSide, OrderStatus,
    SymbolFilters,
};
use crate::error::{TradingError, TradingResult};

/// Exchange operations failures can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Place,
    Cancel,
    Query,
    OpenOrders,
    Balances,
    Ticker,
    Trades,
}

#[derive(Debug)]
struct PaperState {
    price: Decimal,
    orders: BTreeMap<String, LiveOrder>,
    by_client: HashMap<String, String>,
    trades: Vec<TradeRecord>,
    balances: BTreeMap<String, Balance>,
    next_order_id: u64,
    next_trade_id: u64,
    failures: VecDeque<(PaperOp, TradingError)>,
    /// Accept the next N placements but answer with a timeout
    lose_place_acks: usize,
    calls: HashMap<PaperOp, usize>,
    script: VecDeque<Decimal>,
}

/// Simulated exchange. Orders fill in full at their limit price once the
/// market price reaches them. With a volatility set, every ticker request
/// moves the price one random-walk step; scripted prices take precedence.
pub struct PaperExchange {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    tick_size: Decimal,
    volatility: Option<f64>,
    filters: Option<SymbolFilters>,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(symbol: &str, price: Decimal) -> Self {
        let (base_asset, quote_asset) = split_symbol(symbol);
        Self {
            symbol: symbol.to_string(),
            base_asset,
            quote_asset,
            tick_size: Decimal::new(1, 2),
            volatility: None,
            filters: None,
            state: Mutex::new(PaperState {
                price,
                orders: BTreeMap::new(),
                by_client: HashMap::new(),
                trades: Vec::new(),
                balances: BTreeMap::new(),
                next_order_id: 1,
                next_trade_id: 1,
                failures: VecDeque::new(),
                lose_place_acks: 0,
                calls: HashMap::new(),
                script: VecDeque::new(),
            }),
        }
    }

    /// Random-walk the price by up to `volatility` (fraction) per ticker request
    pub fn with_random_walk(mut self, volatility: f64, tick_size: Decimal) -> Self {
        self.volatility = Some(volatility);
        self.tick_size = tick_size;
        self
    }

    /// Trading rules served by `symbol_filters` instead of the permissive defaults
    pub fn with_filters(mut self, filters: SymbolFilters) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_balance(self, asset: &str, free: Decimal) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.balances.insert(
                asset.to_string(),
                Balance {
                    asset: asset.to_string(),
                    free,
                    locked: Decimal::ZERO,
                },
            );
        }
        self
    }

    fn lock(&self) -> TradingResult<MutexGuard<'_, PaperState>> {
        self.state
            .lock()
            .map_err(|_| TradingError::Internal("paper exchange state poisoned".to_string()))
    }

    // Market control

    pub fn price(&self) -> Decimal {
        self.lock().map(|state| state.price).unwrap_or_default()
    }

    /// Move the market and fill every order it crosses
    pub fn set_price(&self, price: Decimal) {
        if let Ok(mut state) = self.lock() {
            state.price = price;
            Self::match_orders(&mut state, &self.base_asset, &self.quote_asset);
        }
    }

    /// Overwrite an asset's free balance, as a transfer out of the account would
    pub fn set_free_balance(&self, asset: &str, free: Decimal) {
        if let Ok(mut state) = self.lock() {
            let balance = state.balances.entry(asset.to_string()).or_insert_with(|| Balance {
                asset: asset.to_string(),
                free: Decimal::ZERO,
                locked: Decimal::ZERO,
            });
            balance.free = free;
        }
    }

    /// Prices served by the following ticker requests, one per request
    pub fn script_prices(&self, prices: impl IntoIterator<Item = Decimal>) {
        if let Ok(mut state) = self.lock() {
            state.script.extend(prices);
        }
    }

    /// Execute part of an order regardless of price
    pub fn fill_order(&self, exchange_order_id: &str, quantity: Decimal) -> TradingResult<()> {
        let mut state = self.lock()?;
        Self::execute(&mut state, exchange_order_id, Some(quantity), &self.base_asset, &self.quote_asset)
    }

    /// Drop an order from the book without a fill, as if cancelled elsewhere
    pub fn vanish_order(&self, exchange_order_id: &str) -> TradingResult<()> {
        let mut state = self.lock()?;
        let order = state
            .orders
            .get(exchange_order_id)
            .cloned()
            .ok_or_else(|| TradingError::NotFound(exchange_order_id.to_string()))?;
        Self::release(&mut state, &order, &self.base_asset, &self.quote_asset);
        if let Some(order) = state.orders.get_mut(exchange_order_id) {
            order.status = OrderStatus::Canceled;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Place an order that does not belong to any grid level
    pub fn insert_foreign_order(&self, side: OrderSide, price: Decimal, quantity: Decimal) -> String {
        let Ok(mut state) = self.lock() else {
            return String::new();
        };
        let id = format!("P{}", state.next_order_id);
        state.next_order_id += 1;
        state.orders.insert(
            id.clone(),
            LiveOrder {
                exchange_order_id: id.clone(),
                client_order_id: None,
                side,
                price,
                quantity,
                executed_quantity: Decimal::ZERO,
                status: OrderStatus::New,
                updated_at: Utc::now(),
            },
        );
        id
    }

    // Failure injection

    /// The next call of `op` fails with `error`
    pub fn inject_failure(&self, op: PaperOp, error: TradingError) {
        self.inject_failures(op, error, 1);
    }

    pub fn inject_failures(&self, op: PaperOp, error: TradingError, times: usize) {
        if let Ok(mut state) = self.lock() {
            for _ in 0..times {
                state.failures.push_back((op, error.clone()));
            }
        }
    }

    /// The next `times` placements reach the book but the caller sees a timeout
    pub fn lose_place_acks(&self, times: usize) {
        if let Ok(mut state) = self.lock() {
            state.lose_place_acks = times;
        }
    }

    pub fn call_count(&self, op: PaperOp) -> usize {
        self.lock()
            .map(|state| state.calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn order(&self, exchange_order_id: &str) -> Option<LiveOrder> {
        self.lock().ok()?.orders.get(exchange_order_id).cloned()
    }

    pub fn live_orders(&self) -> Vec<LiveOrder> {
        self.lock()
            .map(|state| state.orders.values().filter(|o| o.status.is_open()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn balance(&self, asset: &str) -> Option<Balance> {
        self.lock().ok()?.balances.get(asset).cloned()
    }

    fn begin_call(&self, op: PaperOp) -> TradingResult<MutexGuard<'_, PaperState>> {
        let mut state = self.lock()?;
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(pos) = state.failures.iter().position(|(failing, _)| *failing == op) {
            if let Some((_, error)) = state.failures.remove(pos) {
                debug!("Paper exchange injecting {:?} failure: {}", op, error);
                return Err(error);
            }
        }
        Ok(state)
    }

    fn next_price(&self, state: &mut PaperState) {
        if let Some(price) = state.script.pop_front() {
            state.price = price;
        } else if let Some(volatility) = self.volatility {
            let step = rand::thread_rng().gen_range(-volatility..=volatility);
            let factor = Decimal::from_f64(1.0 + step).unwrap_or(Decimal::ONE);
            let next = round_to_tick(state.price * factor, self.tick_size);
            if next > Decimal::ZERO {
                state.price = next;
            }
        } else {
            return;
        }
        Self::match_orders(state, &self.base_asset, &self.quote_asset);
    }

    fn match_orders(state: &mut PaperState, base: &str, quote: &str) {
        let price = state.price;
        let crossing: Vec<String> = state
            .orders
            .values()
            .filter(|order| order.status.is_open())
            .filter(|order| match order.side {
                OrderSide::Buy => price <= order.price,
                OrderSide::Sell => price >= order.price,
            })
            .map(|order| order.exchange_order_id.clone())
            .collect();

        for id in crossing {
            // Cannot fail: the id was just taken from the book
            let _ = Self::execute(state, &id, None, base, quote);
        }
    }

    /// Fill `quantity` (or the rest) of an order at its limit price
    fn execute(
        state: &mut PaperState,
        exchange_order_id: &str,
        quantity: Option<Decimal>,
        base: &str,
        quote: &str,
    ) -> TradingResult<()> {
        let trade_id = state.next_trade_id;
        let order = state
            .orders
            .get_mut(exchange_order_id)
            .ok_or_else(|| TradingError::NotFound(exchange_order_id.to_string()))?;
        if !order.status.is_open() {
            return Err(TradingError::Rejected(format!("order {} is not open", exchange_order_id)));
        }

        let remaining = order.quantity - order.executed_quantity;
        let quantity = quantity.unwrap_or(remaining).min(remaining);
        if quantity <= Decimal::ZERO {
            return Ok(());
        }

        order.executed_quantity += quantity;
        order.status = if order.executed_quantity >= order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let now = Utc::now();
        order.updated_at = now;
        let side = order.side;
        let price = order.price;
        let fill = FillEvent::new(exchange_order_id, quantity, price, now);

        state.next_trade_id += 1;
        state.trades.push(TradeRecord {
            trade_id: format!("T{}", trade_id),
            fill,
        });

        let notional = price * quantity;
        match side {
            OrderSide::Buy => {
                Self::adjust(state, quote, Decimal::ZERO, -notional);
                Self::adjust(state, base, quantity, Decimal::ZERO);
            }
            OrderSide::Sell => {
                Self::adjust(state, base, Decimal::ZERO, -quantity);
                Self::adjust(state, quote, notional, Decimal::ZERO);
            }
        }
        Ok(())
    }

    /// Unlock the unfilled part of an order
    fn release(state: &mut PaperState, order: &LiveOrder, base: &str, quote: &str) {
        let remaining = order.quantity - order.executed_quantity;
        match order.side {
            OrderSide::Buy => {
                let notional = order.price * remaining;
                Self::adjust(state, quote, notional, -notional);
            }
            OrderSide::Sell => Self::adjust(state, base, remaining, -remaining),
        }
    }

    /// Only assets given a starting balance are tracked
    fn adjust(state: &mut PaperState, asset: &str, free: Decimal, locked: Decimal) {
        if let Some(balance) = state.balances.get_mut(asset) {
            balance.free += free;
            balance.locked = (balance.locked + locked).max(Decimal::ZERO);
        }
    }

    fn find<'a>(state: &'a PaperState, handle: &OrderHandle) -> Option<&'a LiveOrder> {
        match &handle.exchange_order_id {
            Some(id) => state.orders.get(id),
            None => state
                .by_client
                .get(handle.client_order_id.as_str())
                .and_then(|id| state.orders.get(id)),
        }
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_order(&self, request: &OrderRequest) -> TradingResult<OrderHandle> {
        let mut state = self.begin_call(PaperOp::Place)?;

        if request.symbol != self.symbol {
            return Err(TradingError::Rejected(format!("unknown symbol {}", request.symbol)));
        }
        if state.by_client.contains_key(request.client_order_id.as_str()) {
            return Err(TradingError::DuplicateOrder(request.client_order_id.to_string()));
        }
        if request.price <= Decimal::ZERO || request.quantity <= Decimal::ZERO {
            return Err(TradingError::Rejected("price and quantity must be positive".to_string()));
        }

        // Lock funds when the account is tracked; untracked assets are unlimited
        let (asset, required) = match request.side {
            OrderSide::Buy => (&self.quote_asset, request.price * request.quantity),
            OrderSide::Sell => (&self.base_asset, request.quantity),
        };
        if let Some(balance) = state.balances.get(asset.as_str()) {
            if balance.free < required {
                return Err(TradingError::Rejected(format!(
                    "Insufficient balance: {} {} required, {} free",
                    required, asset, balance.free
                )));
            }
            Self::adjust(&mut state, asset, -required, required);
        }

        let id = format!("P{}", state.next_order_id);
        state.next_order_id += 1;
        state.by_client.insert(request.client_order_id.to_string(), id.clone());
        state.orders.insert(
            id.clone(),
            LiveOrder {
                exchange_order_id: id.clone(),
                client_order_id: Some(request.client_order_id.clone()),
                side: request.side,
                price: request.price,
                quantity: request.quantity,
                executed_quantity: Decimal::ZERO,
                status: OrderStatus::New,
                updated_at: Utc::now(),
            },
        );
        Self::match_orders(&mut state, &self.base_asset, &self.quote_asset);

        if state.lose_place_acks > 0 {
            state.lose_place_acks -= 1;
            return Err(TradingError::TransientNetwork("response timed out".to_string()));
        }

        Ok(OrderHandle {
            client_order_id: request.client_order_id.clone(),
            exchange_order_id: Some(id),
        })
    }

    async fn cancel_order(&self, _symbol: &str, handle: &OrderHandle) -> TradingResult<()> {
        let mut state = self.begin_call(PaperOp::Cancel)?;
        let order = Self::find(&state, handle)
            .filter(|order| order.status.is_open())
            .cloned()
            .ok_or_else(|| TradingError::NotFound(format!("Unknown order {}", handle.client_order_id)))?;

        Self::release(&mut state, &order, &self.base_asset, &self.quote_asset);
        if let Some(order) = state.orders.get_mut(&order.exchange_order_id) {
            order.status = OrderStatus::Canceled;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn query_order(&self, _symbol: &str, handle: &OrderHandle) -> TradingResult<Option<LiveOrder>> {
        let state = self.begin_call(PaperOp::Query)?;
        Ok(Self::find(&state, handle).cloned())
    }

    async fn open_orders(&self, _symbol: &str) -> TradingResult<Vec<LiveOrder>> {
        let state = self.begin_call(PaperOp::OpenOrders)?;
        Ok(state.orders.values().filter(|o| o.status.is_open()).cloned().collect())
    }

    async fn balances(&self) -> TradingResult<Vec<Balance>> {
        let state = self.begin_call(PaperOp::Balances)?;
        Ok(state.balances.values().cloned().collect())
    }

    async fn ticker_price(&self, _symbol: &str) -> TradingResult<Decimal> {
        let mut state = self.begin_call(PaperOp::Ticker)?;
        self.next_price(&mut state);
        Ok(state.price)
    }

    async fn symbol_filters(&self, symbol: &str) -> TradingResult<SymbolFilters> {
        if !symbol.eq_ignore_ascii_case(&self.symbol) {
            return Err(TradingError::NotFound(format!("symbol {} is not listed", symbol)));
        }
        Ok(self.filters.clone().unwrap_or_else(|| SymbolFilters {
            symbol: self.symbol.clone(),
            status: "ENABLED".to_string(),
            tick_size: self.tick_size,
            qty_step: Decimal::new(1, 8),
            min_qty: Decimal::new(1, 8),
            min_notional: Decimal::ONE,
        }))
    }

    async fn trades_since(&self, _symbol: &str, since_ms: i64) -> TradingResult<Vec<TradeRecord>> {
        let state = self.begin_call(PaperOp::Trades)?;
        Ok(state
            .trades
            .iter()
            .filter(|trade| trade.fill.timestamp.timestamp_millis() >= since_ms)
            .cloned()
            .collect())
    }
}
