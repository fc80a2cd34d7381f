// MEXC REST transport against a mock HTTP server

use mexc_grid_bot::clients::{ExchangeApi, MexcClient};
use mexc_grid_bot::config::ExchangeConfig;
use mexc_grid_bot::core::{ClientOrderId, OrderHandle, OrderSide, OrderStatus};
use mexc_grid_bot::core::types::OrderRequest;
use mexc_grid_bot::TradingError;
use mockito::{Matcher, Server};
use rust_decimal_macros::dec;

fn client_for(server: &Server) -> MexcClient {
    let config = ExchangeConfig {
        rest_url: server.url(),
        api_key: "test-key".to_string(),
        api_secret: "test-secret".to_string(),
        recv_window_ms: 5000,
        request_timeout_secs: 5,
    };
    MexcClient::new(&config).expect("client")
}

fn signed() -> Matcher {
    Matcher::AllOf(vec![
        Matcher::Regex("signature=[0-9a-f]{64}".to_string()),
        Matcher::Regex("timestamp=[0-9]+".to_string()),
        Matcher::UrlEncoded("recvWindow".to_string(), "5000".to_string()),
    ])
}

#[tokio::test]
async fn test_place_order_is_signed_and_returns_exchange_id() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v3/order")
        .match_header("X-MEXC-APIKEY", "test-key")
        .match_query(Matcher::AllOf(vec![
            signed(),
            Matcher::UrlEncoded("symbol".to_string(), "BTCUSDT".to_string()),
            Matcher::UrlEncoded("side".to_string(), "BUY".to_string()),
            Matcher::UrlEncoded("type".to_string(), "LIMIT".to_string()),
            Matcher::UrlEncoded("price".to_string(), "65000.5".to_string()),
            Matcher::UrlEncoded("quantity".to_string(), "0.001".to_string()),
            Matcher::UrlEncoded("newClientOrderId".to_string(), "grid7".to_string()),
        ]))
        .with_status(200)
        .with_body(r#"{"symbol":"BTCUSDT","orderId":"C02__442","price":"65000.5","origQty":"0.001"}"#)
        .create_async()
        .await;

    let client = client_for(&server);
    let request = OrderRequest {
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        price: dec!(65000.50),
        quantity: dec!(0.0010),
        client_order_id: ClientOrderId::from("grid7"),
    };
    let handle = client.place_order(&request).await.unwrap();

    mock.assert_async().await;
    assert_eq!(handle.exchange_order_id.as_deref(), Some("C02__442"));
    assert_eq!(handle.client_order_id, ClientOrderId::from("grid7"));
}

#[tokio::test]
async fn test_ticker_is_public() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v3/ticker/price")
        .match_query(Matcher::UrlEncoded("symbol".to_string(), "BTCUSDT".to_string()))
        .with_status(200)
        .with_body(r#"{"symbol":"BTCUSDT","price":"64123.45"}"#)
        .create_async()
        .await;

    let price = client_for(&server).ticker_price("BTCUSDT").await.unwrap();

    mock.assert_async().await;
    assert_eq!(price, dec!(64123.45));
}

#[tokio::test]
async fn test_exchange_info_yields_symbol_filters() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v3/exchangeInfo")
        .match_query(Matcher::UrlEncoded("symbol".to_string(), "BTCUSDT".to_string()))
        .with_status(200)
        .with_body(
            r#"{"timezone":"CST","symbols":[{"symbol":"BTCUSDT","status":"1","quotePrecision":2,
            "baseSizePrecision":"0.000001","quoteAmountPrecision":"1","filters":[
            {"filterType":"PRICE_FILTER","tickSize":"0.01"},
            {"filterType":"LOT_SIZE","stepSize":"0.0001","minQty":"0.0002"},
            {"filterType":"MIN_NOTIONAL","minNotional":"5"}]}]}"#,
        )
        .create_async()
        .await;

    let filters = client_for(&server).symbol_filters("BTCUSDT").await.unwrap();

    mock.assert_async().await;
    assert!(filters.is_trading());
    assert_eq!(filters.tick_size, dec!(0.01));
    assert_eq!(filters.qty_step, dec!(0.0001));
    assert_eq!(filters.min_qty, dec!(0.0002));
    assert_eq!(filters.min_notional, dec!(5));
}

#[tokio::test]
async fn test_unlisted_symbol_is_not_found() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/exchangeInfo")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"symbols":[]}"#)
        .create_async()
        .await;

    let err = client_for(&server).symbol_filters("NOPEUSDT").await.unwrap_err();
    assert!(matches!(err, TradingError::NotFound(_)));
}

#[tokio::test]
async fn test_open_orders_decoding() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/openOrders")
        .match_query(Matcher::AllOf(vec![
            signed(),
            Matcher::UrlEncoded("symbol".to_string(), "BTCUSDT".to_string()),
        ]))
        .with_status(200)
        .with_body(
            r#"[
                {"orderId":"101","clientOrderId":"g1","price":"64000","origQty":"0.001","executedQty":"0","status":"NEW","side":"BUY","updateTime":1700000000000},
                {"orderId":102,"clientOrderId":"","price":"66000","origQty":"0.001","executedQty":"0.0005","status":"PARTIALLY_FILLED","side":"SELL","time":1700000000500}
            ]"#,
        )
        .create_async()
        .await;

    let orders = client_for(&server).open_orders("BTCUSDT").await.unwrap();

    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].client_order_id, Some(ClientOrderId::from("g1")));
    assert_eq!(orders[0].side, OrderSide::Buy);
    assert_eq!(orders[1].exchange_order_id, "102");
    assert_eq!(orders[1].client_order_id, None);
    assert_eq!(orders[1].status, OrderStatus::PartiallyFilled);
    assert_eq!(orders[1].executed_quantity, dec!(0.0005));
}

#[tokio::test]
async fn test_account_balances() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/account")
        .match_query(signed())
        .with_status(200)
        .with_body(
            r#"{"canTrade":true,"balances":[
                {"asset":"USDT","free":"1500.25","locked":"200"},
                {"asset":"BTC","free":"0.05","locked":"0"}
            ]}"#,
        )
        .create_async()
        .await;

    let balances = client_for(&server).balances().await.unwrap();

    let usdt = balances.iter().find(|b| b.asset == "USDT").unwrap();
    assert_eq!(usdt.free, dec!(1500.25));
    assert_eq!(usdt.locked, dec!(200));
    assert_eq!(balances.len(), 2);
}

#[tokio::test]
async fn test_trades_are_sorted_into_fills() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/myTrades")
        .match_query(Matcher::AllOf(vec![
            signed(),
            Matcher::UrlEncoded("startTime".to_string(), "1700000000000".to_string()),
        ]))
        .with_status(200)
        .with_body(
            r#"[
                {"id":"t2","orderId":"101","price":"64000","qty":"0.0004","time":1700000002000},
                {"id":"t1","orderId":"101","price":"64000","qty":"0.0006","time":1700000001000}
            ]"#,
        )
        .create_async()
        .await;

    let trades = client_for(&server).trades_since("BTCUSDT", 1_700_000_000_000).await.unwrap();

    assert_eq!(trades.len(), 2);
    assert_eq!(trades[0].trade_id, "t1");
    assert_eq!(trades[0].fill.exchange_order_id, "101");
    assert_eq!(trades[0].fill.quantity, dec!(0.0006));
    assert_eq!(trades[1].fill.timestamp.timestamp_millis(), 1_700_000_002_000);
}

#[tokio::test]
async fn test_unknown_order_query_is_none() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/order")
        .match_query(Matcher::UrlEncoded("origClientOrderId".to_string(), "lost".to_string()))
        .with_status(400)
        .with_body(r#"{"code":-2011,"msg":"Unknown order sent."}"#)
        .create_async()
        .await;

    let handle = OrderHandle {
        client_order_id: ClientOrderId::from("lost"),
        exchange_order_id: None,
    };
    let result = client_for(&server).query_order("BTCUSDT", &handle).await.unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_http_failures_map_to_error_kinds() {
    let mut server = Server::new_async().await;
    server
        .mock("DELETE", "/api/v3/order")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_body(r#"{"code":429,"msg":"Too many requests"}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/api/v3/ticker/price")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("Service Unavailable")
        .create_async()
        .await;

    let client = client_for(&server);
    let handle = OrderHandle {
        client_order_id: ClientOrderId::from("g1"),
        exchange_order_id: Some("101".to_string()),
    };

    let err = client.cancel_order("BTCUSDT", &handle).await.unwrap_err();
    assert!(matches!(err, TradingError::Throttled(_)));

    let err = client.ticker_price("BTCUSDT").await.unwrap_err();
    assert!(matches!(err, TradingError::TransientNetwork(_)));
}
