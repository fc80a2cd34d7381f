// Exchange gateway: rate-limited, retrying access to one exchange for one symbol

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, Stream};
use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::clients::rate_limit::TokenBucket;
use crate::config::GatewayConfig;
use crate::core::error_handling::{GracefulShutdown, RetryPolicy};
use crate::core::types::{
    Balance, ClientOrderId, FillEvent, LiveOrder, OrderHandle, OrderRequest, OrderSide, SymbolFilters,
};
use crate::error::{TradingError, TradingResult};

/// Trade ids remembered across polls so overlapping windows never repeat a fill
const CURSOR_MEMORY: usize = 2048;

/// One execution as reported by the exchange's trade history
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub trade_id: String,
    pub fill: FillEvent,
}

/// What the engine needs from an exchange. Implemented by the MEXC REST
/// transport and by the in-process paper exchange.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    fn name(&self) -> &str;

    async fn place_order(&self, request: &OrderRequest) -> TradingResult<OrderHandle>;

    async fn cancel_order(&self, symbol: &str, handle: &OrderHandle) -> TradingResult<()>;

    /// Look an order up by exchange id, or by client id when the exchange id is unknown
    async fn query_order(&self, symbol: &str, handle: &OrderHandle) -> TradingResult<Option<LiveOrder>>;

    async fn open_orders(&self, symbol: &str) -> TradingResult<Vec<LiveOrder>>;

    async fn balances(&self) -> TradingResult<Vec<Balance>>;

    async fn ticker_price(&self, symbol: &str) -> TradingResult<Decimal>;

    /// Price and quantity rules for `symbol`
    async fn symbol_filters(&self, symbol: &str) -> TradingResult<SymbolFilters>;

    /// Executions at or after `since_ms`, oldest first
    async fn trades_since(&self, symbol: &str, since_ms: i64) -> TradingResult<Vec<TradeRecord>>;
}

/// Position in the exchange's trade history
#[derive(Debug, Clone)]
pub struct FillCursor {
    since_ms: i64,
    seen: VecDeque<String>,
    seen_set: HashSet<String>,
}

impl FillCursor {
    pub fn starting_at(since_ms: i64) -> Self {
        Self {
            since_ms,
            seen: VecDeque::new(),
            seen_set: HashSet::new(),
        }
    }

    pub fn since_ms(&self) -> i64 {
        self.since_ms
    }

    /// Keep the records not delivered before and move the cursor past them
    pub fn accept(&mut self, records: Vec<TradeRecord>) -> Vec<FillEvent> {
        let mut fresh = Vec::new();
        for record in records {
            if !self.seen_set.insert(record.trade_id.clone()) {
                continue;
            }
            self.seen.push_back(record.trade_id);
            if self.seen.len() > CURSOR_MEMORY {
                if let Some(oldest) = self.seen.pop_front() {
                    self.seen_set.remove(&oldest);
                }
            }
            self.since_ms = self.since_ms.max(record.fill.timestamp.timestamp_millis());
            fresh.push(record.fill);
        }
        fresh
    }
}

pub struct ExchangeGateway {
    api: Arc<dyn ExchangeApi>,
    symbol: String,
    limiter: TokenBucket,
    retry: RetryPolicy,
    shutdown: GracefulShutdown,
    fill_poll_interval: Duration,
    cursor: Mutex<FillCursor>,
}

impl ExchangeGateway {
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        symbol: &str,
        config: &GatewayConfig,
        shutdown: GracefulShutdown,
    ) -> Self {
        Self {
            api,
            symbol: symbol.to_string(),
            limiter: TokenBucket::from_config(config),
            retry: RetryPolicy::from_config(config),
            shutdown,
            fill_poll_interval: Duration::from_millis(config.fill_poll_interval_ms),
            cursor: Mutex::new(FillCursor::starting_at(Utc::now().timestamp_millis())),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn exchange_name(&self) -> &str {
        self.api.name()
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn shutdown(&self) -> &GracefulShutdown {
        &self.shutdown
    }

    /// Calls waiting on the local rate limiter
    pub fn queued_calls(&self) -> usize {
        self.limiter.queued()
    }

    /// Place a limit order under a freshly generated client order id
    pub async fn place_order(&self, side: OrderSide, price: Decimal, quantity: Decimal) -> TradingResult<OrderHandle> {
        self.place_order_with_id(side, price, quantity, ClientOrderId::generate())
            .await
    }

    /// Place a limit order under a client order id the caller already recorded.
    /// A duplicate-id answer means an earlier attempt reached the exchange; that order is returned.
    pub async fn place_order_with_id(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        client_order_id: ClientOrderId,
    ) -> TradingResult<OrderHandle> {
        self.shutdown.check()?;
        let _guard = self.shutdown.register_operation();

        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side,
            price,
            quantity,
            client_order_id,
        };

        let api = &self.api;
        let limiter = &self.limiter;
        let req = &request;
        let result = self
            .retry
            .execute("place_order", move |_| async move {
                limiter.acquire().await?;
                api.place_order(req).await
            })
            .await;

        match result {
            Err(TradingError::DuplicateOrder(msg)) => {
                let lookup = OrderHandle {
                    client_order_id: request.client_order_id.clone(),
                    exchange_order_id: None,
                };
                match self.query_order(&lookup).await? {
                    Some(order) => {
                        info!(
                            "🔎 Order {} already on the exchange as {}, adopting it",
                            request.client_order_id, order.exchange_order_id
                        );
                        Ok(OrderHandle {
                            client_order_id: request.client_order_id,
                            exchange_order_id: Some(order.exchange_order_id),
                        })
                    }
                    None => Err(TradingError::Rejected(format!(
                        "exchange reported duplicate client id {} but has no such order: {}",
                        request.client_order_id, msg
                    ))),
                }
            }
            other => other,
        }
    }

    /// Cancel an order. NotFound on a retried attempt means an earlier attempt succeeded.
    pub async fn cancel_order(&self, handle: &OrderHandle) -> TradingResult<()> {
        let _guard = self.shutdown.register_operation();

        let api = &self.api;
        let limiter = &self.limiter;
        let symbol = self.symbol.as_str();
        self.retry
            .execute("cancel_order", move |attempt| async move {
                limiter.acquire().await?;
                match api.cancel_order(symbol, handle).await {
                    Err(TradingError::NotFound(msg)) if attempt > 0 => {
                        debug!("Cancel retry for {} found nothing ({}), treating as done", handle.client_order_id, msg);
                        Ok(())
                    }
                    other => other,
                }
            })
            .await
    }

    pub async fn query_order(&self, handle: &OrderHandle) -> TradingResult<Option<LiveOrder>> {
        let api = &self.api;
        let limiter = &self.limiter;
        let symbol = self.symbol.as_str();
        self.retry
            .execute("query_order", move |_| async move {
                limiter.acquire().await?;
                api.query_order(symbol, handle).await
            })
            .await
    }

    /// Find an order by the client id it was submitted with
    pub async fn find_by_client_id(&self, client_order_id: &ClientOrderId) -> TradingResult<Option<LiveOrder>> {
        let handle = OrderHandle {
            client_order_id: client_order_id.clone(),
            exchange_order_id: None,
        };
        self.query_order(&handle).await
    }

    pub async fn open_orders(&self) -> TradingResult<Vec<LiveOrder>> {
        let api = &self.api;
        let limiter = &self.limiter;
        let symbol = self.symbol.as_str();
        self.retry
            .execute("open_orders", move |_| async move {
                limiter.acquire().await?;
                api.open_orders(symbol).await
            })
            .await
    }

    pub async fn balances(&self) -> TradingResult<Vec<Balance>> {
        let api = &self.api;
        let limiter = &self.limiter;
        self.retry
            .execute("balances", move |_| async move {
                limiter.acquire().await?;
                api.balances().await
            })
            .await
    }

    pub async fn ticker_price(&self) -> TradingResult<Decimal> {
        let api = &self.api;
        let limiter = &self.limiter;
        let symbol = self.symbol.as_str();
        self.retry
            .execute("ticker_price", move |_| async move {
                limiter.acquire().await?;
                api.ticker_price(symbol).await
            })
            .await
    }

    /// Fetch executions newer than the shared cursor
    pub async fn poll_fills(&self) -> TradingResult<Vec<FillEvent>> {
        let mut cursor = self.cursor.lock().await;
        let since_ms = cursor.since_ms();

        let api = &self.api;
        let limiter = &self.limiter;
        let symbol = self.symbol.as_str();
        let records = self
            .retry
            .execute("trades_since", move |_| async move {
                limiter.acquire().await?;
                api.trades_since(symbol, since_ms).await
            })
            .await?;

        Ok(cursor.accept(records))
    }

    /// Infinite stream of fills. Poll errors are logged and retried on the next
    /// interval, so the stream survives transport outages. It ends when `stop`
    /// turns true. The cursor lives in the gateway, so a new stream resumes
    /// where the previous one stopped.
    pub fn stream_fills(self: &Arc<Self>, stop: watch::Receiver<bool>) -> impl Stream<Item = FillEvent> + Send + 'static {
        let state = FillStreamState {
            gateway: Arc::clone(self),
            buffer: VecDeque::new(),
            stop,
            polled: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(fill) = state.buffer.pop_front() {
                    return Some((fill, state));
                }
                if *state.stop.borrow() {
                    return None;
                }

                if state.polled {
                    let interval = state.gateway.fill_poll_interval;
                    tokio::select! {
                        changed = state.stop.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                            continue;
                        }
                        _ = sleep(interval) => {}
                    }
                }
                state.polled = true;

                match state.gateway.poll_fills().await {
                    Ok(fills) => state.buffer.extend(fills),
                    Err(e) => warn!("📡 Fill poll failed, will retry: {}", e),
                }
            }
        })
    }
}

struct FillStreamState {
    gateway: Arc<ExchangeGateway>,
    buffer: VecDeque<FillEvent>,
    stop: watch::Receiver<bool>,
    polled: bool,
}
