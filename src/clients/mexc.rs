// MEXC spot REST v3 transport

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use crate::clients::gateway::{ExchangeApi, TradeRecord};
use crate::config::ExchangeConfig;
use crate::core::types::{
    Balance, ClientOrderId, FillEvent, LiveOrder, OrderHandle, OrderRequest, OrderSide, OrderStatus,
    SymbolFilters,
};
use crate::error::{TradingError, TradingResult};

type HmacSha256 = Hmac<Sha256>;

/// MEXC error code for cancel/query of an order it does not know
const UNKNOWN_ORDER_CODE: i64 = -2011;

// Used when exchangeInfo omits a rule
const DEFAULT_TICK_SIZE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);
const DEFAULT_QTY_STEP: Decimal = Decimal::from_parts(1, 0, 0, false, 4);
const DEFAULT_MIN_NOTIONAL: Decimal = Decimal::TEN;

/// HMAC-SHA256 of `query` keyed by `secret`, lowercase hex
pub fn sign_query(secret: &str, query: &str) -> TradingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| TradingError::ConfigurationInvalid(format!("unusable API secret: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Translate a non-success MEXC response into the error taxonomy
pub fn map_error(status: StatusCode, body: &str) -> TradingError {
    let parsed: Option<ApiError> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().and_then(|e| e.code);
    let msg = parsed
        .and_then(|e| e.msg)
        .unwrap_or_else(|| body.chars().take(200).collect());
    let lower = msg.to_lowercase();

    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        TradingError::Throttled(msg)
    } else if status.is_server_error() {
        TradingError::TransientNetwork(format!("{}: {}", status, msg))
    } else if code == Some(UNKNOWN_ORDER_CODE)
        || lower.contains("unknown order")
        || lower.contains("order does not exist")
    {
        TradingError::NotFound(msg)
    } else if lower.contains("duplicate") {
        TradingError::DuplicateOrder(msg)
    } else {
        TradingError::Rejected(match code {
            Some(code) => format!("{} (code {})", msg, code),
            None => msg,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<i64>,
    msg: Option<String>,
}

/// MEXC sends ids either as strings or as numbers depending on endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IdValue {
    Text(String),
    Number(i64),
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Text(text) => f.write_str(text),
            IdValue::Number(number) => write!(f, "{}", number),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlacedOrder {
    order_id: IdValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MexcOrder {
    order_id: IdValue,
    #[serde(default)]
    client_order_id: Option<String>,
    price: Decimal,
    orig_qty: Decimal,
    #[serde(default)]
    executed_qty: Decimal,
    status: String,
    side: String,
    #[serde(default)]
    update_time: Option<i64>,
    #[serde(default)]
    time: Option<i64>,
}

impl MexcOrder {
    fn into_live_order(self) -> TradingResult<LiveOrder> {
        let side = parse_side(&self.side)?;
        let status = OrderStatus::parse(&self.status)
            .ok_or_else(|| TradingError::Decode(format!("unknown order status {}", self.status)))?;
        let updated_ms = self.update_time.or(self.time).unwrap_or_default();

        Ok(LiveOrder {
            exchange_order_id: self.order_id.to_string(),
            client_order_id: self
                .client_order_id
                .filter(|id| !id.is_empty())
                .map(|id| ClientOrderId::from(id.as_str())),
            side,
            price: self.price,
            quantity: self.orig_qty,
            executed_quantity: self.executed_qty,
            status,
            updated_at: millis_to_datetime(updated_ms),
        })
    }
}

#[derive(Debug, Deserialize)]
struct MexcAccount {
    balances: Vec<MexcBalance>,
}

#[derive(Debug, Deserialize)]
struct MexcBalance {
    asset: String,
    free: Decimal,
    locked: Decimal,
}

#[derive(Debug, Deserialize)]
struct MexcTicker {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct MexcExchangeInfo {
    #[serde(default)]
    symbols: Vec<MexcSymbol>,
}

/// MEXC fills `filters` for some symbols only; the precision fields are always present
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MexcSymbol {
    symbol: String,
    status: IdValue,
    #[serde(default)]
    quote_precision: Option<u32>,
    #[serde(default)]
    base_size_precision: Option<Decimal>,
    #[serde(default)]
    quote_amount_precision: Option<Decimal>,
    #[serde(default)]
    filters: Vec<MexcFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MexcFilter {
    filter_type: String,
    #[serde(default)]
    tick_size: Option<Decimal>,
    #[serde(default)]
    step_size: Option<Decimal>,
    #[serde(default)]
    min_qty: Option<Decimal>,
    #[serde(default)]
    min_notional: Option<Decimal>,
}

impl MexcSymbol {
    fn filter(&self, filter_type: &str) -> Option<&MexcFilter> {
        self.filters.iter().find(|f| f.filter_type == filter_type)
    }

    fn into_filters(self) -> SymbolFilters {
        let tick_size = self
            .filter("PRICE_FILTER")
            .and_then(|f| f.tick_size)
            .or_else(|| self.quote_precision.map(|precision| Decimal::new(1, precision)))
            .unwrap_or(DEFAULT_TICK_SIZE);
        let qty_step = self
            .filter("LOT_SIZE")
            .and_then(|f| f.step_size)
            .or(self.base_size_precision)
            .unwrap_or(DEFAULT_QTY_STEP);
        let min_qty = self
            .filter("LOT_SIZE")
            .and_then(|f| f.min_qty)
            .unwrap_or(qty_step);
        let min_notional = self
            .filter("MIN_NOTIONAL")
            .and_then(|f| f.min_notional)
            .or(self.quote_amount_precision)
            .unwrap_or(DEFAULT_MIN_NOTIONAL);

        SymbolFilters {
            symbol: self.symbol,
            status: self.status.to_string(),
            tick_size,
            qty_step,
            min_qty,
            min_notional,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MexcTrade {
    id: IdValue,
    order_id: IdValue,
    price: Decimal,
    qty: Decimal,
    time: i64,
}

fn parse_side(side: &str) -> TradingResult<OrderSide> {
    match side.to_uppercase().as_str() {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => Err(TradingError::Decode(format!("unknown order side {}", other))),
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Signed REST client for MEXC spot
#[derive(Debug, Clone)]
pub struct MexcClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
}

impl MexcClient {
    pub fn new(config: &ExchangeConfig) -> TradingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TradingError::ConfigurationInvalid(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            recv_window_ms: config.recv_window_ms,
        })
    }

    /// Query string with timestamp, recvWindow and signature appended
    fn signed_query(&self, mut params: Vec<(&'static str, String)>) -> TradingResult<String> {
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        params.sort_by(|a, b| a.0.cmp(b.0));

        let query = encode_query(&params);
        let signature = sign_query(&self.api_secret, &query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&'static str, String)>,
        signed: bool,
    ) -> TradingResult<T> {
        let query = if signed {
            self.signed_query(params)?
        } else {
            encode_query(&params)
        };
        let url = if query.is_empty() {
            format!("{}/api/v3{}", self.base_url, path)
        } else {
            format!("{}/api/v3{}?{}", self.base_url, path, query)
        };

        let mut request = self.client.request(method.clone(), &url);
        if signed {
            request = request.header("X-MEXC-APIKEY", &self.api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!("MEXC {} {} -> {}", method, path, status);

        if !status.is_success() {
            return Err(map_error(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| TradingError::Decode(format!("{} {}: {}", method, path, e)))
    }

    fn order_params(symbol: &str, handle: &OrderHandle) -> Vec<(&'static str, String)> {
        let mut params = vec![("symbol", symbol.to_string())];
        match &handle.exchange_order_id {
            Some(id) => params.push(("orderId", id.clone())),
            None => params.push(("origClientOrderId", handle.client_order_id.to_string())),
        }
        params
    }
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait]
impl ExchangeApi for MexcClient {
    fn name(&self) -> &str {
        "mexc"
    }

    async fn place_order(&self, request: &OrderRequest) -> TradingResult<OrderHandle> {
        let params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            ("quantity", request.quantity.normalize().to_string()),
            ("price", request.price.normalize().to_string()),
            ("newClientOrderId", request.client_order_id.to_string()),
        ];
        let placed: PlacedOrder = self.request(Method::POST, "/order", params, true).await?;

        Ok(OrderHandle {
            client_order_id: request.client_order_id.clone(),
            exchange_order_id: Some(placed.order_id.to_string()),
        })
    }

    async fn cancel_order(&self, symbol: &str, handle: &OrderHandle) -> TradingResult<()> {
        let params = Self::order_params(symbol, handle);
        let _: serde_json::Value = self.request(Method::DELETE, "/order", params, true).await?;
        Ok(())
    }

    async fn query_order(&self, symbol: &str, handle: &OrderHandle) -> TradingResult<Option<LiveOrder>> {
        let params = Self::order_params(symbol, handle);
        match self.request::<MexcOrder>(Method::GET, "/order", params, true).await {
            Ok(order) => order.into_live_order().map(Some),
            Err(TradingError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn open_orders(&self, symbol: &str) -> TradingResult<Vec<LiveOrder>> {
        let params = vec![("symbol", symbol.to_string())];
        let orders: Vec<MexcOrder> = self.request(Method::GET, "/openOrders", params, true).await?;
        orders.into_iter().map(MexcOrder::into_live_order).collect()
    }

    async fn balances(&self) -> TradingResult<Vec<Balance>> {
        let account: MexcAccount = self.request(Method::GET, "/account", Vec::new(), true).await?;
        Ok(account
            .balances
            .into_iter()
            .map(|b| Balance {
                asset: b.asset,
                free: b.free,
                locked: b.locked,
            })
            .collect())
    }

    async fn ticker_price(&self, symbol: &str) -> TradingResult<Decimal> {
        let params = vec![("symbol", symbol.to_string())];
        let ticker: MexcTicker = self.request(Method::GET, "/ticker/price", params, false).await?;
        Ok(ticker.price)
    }

    async fn symbol_filters(&self, symbol: &str) -> TradingResult<SymbolFilters> {
        let params = vec![("symbol", symbol.to_string())];
        let info: MexcExchangeInfo = self.request(Method::GET, "/exchangeInfo", params, false).await?;
        info.symbols
            .into_iter()
            .find(|listed| listed.symbol.eq_ignore_ascii_case(symbol))
            .map(MexcSymbol::into_filters)
            .ok_or_else(|| TradingError::NotFound(format!("symbol {} is not listed", symbol)))
    }

    async fn trades_since(&self, symbol: &str, since_ms: i64) -> TradingResult<Vec<TradeRecord>> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("startTime", since_ms.to_string()),
            ("limit", "1000".to_string()),
        ];
        let mut trades: Vec<MexcTrade> = self.request(Method::GET, "/myTrades", params, true).await?;
        trades.sort_by_key(|trade| trade.time);

        Ok(trades
            .into_iter()
            .map(|trade| TradeRecord {
                trade_id: trade.id.to_string(),
                fill: FillEvent::new(
                    &trade.order_id.to_string(),
                    trade.qty,
                    trade.price,
                    millis_to_datetime(trade.time),
                ),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_query_known_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            map_error(StatusCode::TOO_MANY_REQUESTS, "{}"),
            TradingError::Throttled(_)
        ));
        assert!(matches!(
            map_error(StatusCode::BAD_GATEWAY, "<html>"),
            TradingError::TransientNetwork(_)
        ));
        assert!(matches!(
            map_error(StatusCode::BAD_REQUEST, r#"{"code":-2011,"msg":"Unknown order sent."}"#),
            TradingError::NotFound(_)
        ));
        assert!(matches!(
            map_error(StatusCode::BAD_REQUEST, r#"{"code":30000,"msg":"Duplicate clientOrderId"}"#),
            TradingError::DuplicateOrder(_)
        ));
        assert!(matches!(
            map_error(StatusCode::BAD_REQUEST, r#"{"code":30004,"msg":"Insufficient position"}"#),
            TradingError::Rejected(_)
        ));
    }

    #[test]
    fn test_symbol_filters_fall_back_to_precision_fields() {
        let json = r#"{"symbol":"ETHUSDT","status":"1","quotePrecision":2,"baseSizePrecision":"0.0001",
            "quoteAmountPrecision":"1","filters":[]}"#;
        let listed: MexcSymbol = serde_json::from_str(json).unwrap();
        let filters = listed.into_filters();
        assert!(filters.is_trading());
        assert_eq!(filters.tick_size, Decimal::new(1, 2));
        assert_eq!(filters.qty_step, Decimal::new(1, 4));
        assert_eq!(filters.min_qty, Decimal::new(1, 4));
        assert_eq!(filters.min_notional, Decimal::ONE);
    }

    #[test]
    fn test_order_decoding() {
        let json = r#"{"symbol":"BTCUSDT","orderId":"C02__1234","clientOrderId":"grid42","price":"65000.5",
            "origQty":"0.001","executedQty":"0.0004","status":"PARTIALLY_FILLED","side":"SELL","updateTime":1700000000000}"#;
        let order: MexcOrder = serde_json::from_str(json).unwrap();
        let live = order.into_live_order().unwrap();
        assert_eq!(live.exchange_order_id, "C02__1234");
        assert_eq!(live.side, OrderSide::Sell);
        assert_eq!(live.status, OrderStatus::PartiallyFilled);
        assert_eq!(live.client_order_id, Some(ClientOrderId::from("grid42")));
    }
}
