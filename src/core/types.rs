// Common types shared by the ledger, engine and gateway

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Exchange wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// Direction of the mirrored replacement in level indices
    pub fn replacement_offset(&self) -> i64 {
        match self {
            OrderSide::Buy => 1,
            OrderSide::Sell => -1,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the single order slot a level owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelState {
    /// No order
    Empty,
    /// Submitted, not yet acknowledged
    PendingOpen,
    /// Resting on the book
    Open,
    /// Cancel submitted, not yet confirmed
    PendingCancel,
    /// Completely filled, mirrored replacement still owed
    Filled,
    /// Placement failed after gateway retries
    Failed,
}

impl LevelState {
    /// Counts toward the open order budget
    pub fn is_live(&self) -> bool {
        matches!(self, LevelState::PendingOpen | LevelState::Open | LevelState::PendingCancel)
    }
}

/// Why a placement failed, kept on the level until it is retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementFailure {
    pub reason: String,
    /// Reconciliation retries the level automatically when set
    pub retryable: bool,
    pub failed_at: DateTime<Utc>,
}

/// Idempotency token sent as the exchange's client order id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Fresh token; MEXC accepts up to 32 characters
    pub fn generate() -> Self {
        Self(format!("grid{}", &Uuid::new_v4().simple().to_string()[..28]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientOrderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to an order the gateway has submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub client_order_id: ClientOrderId,
    pub exchange_order_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub client_order_id: ClientOrderId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    /// Parse the exchange status string
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" | "PARTIALLY_CANCELED" => Some(OrderStatus::Canceled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

/// Exchange-side view of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveOrder {
    pub exchange_order_id: String,
    pub client_order_id: Option<ClientOrderId>,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub executed_quantity: Decimal,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// Trading rules the exchange enforces for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub symbol: String,
    pub status: String,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

impl SymbolFilters {
    /// MEXC reports "1" or "ENABLED" for tradable symbols
    pub fn is_trading(&self) -> bool {
        matches!(self.status.to_uppercase().as_str(), "1" | "ENABLED" | "TRADING")
    }
}

/// One execution reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub exchange_order_id: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Total executed on the order after this fill, when the source knows it
    #[serde(default)]
    pub cumulative_quantity: Option<Decimal>,
    /// Produced by reconciliation rather than the exchange feed
    #[serde(default)]
    pub synthetic: bool,
}

impl FillEvent {
    pub fn new(exchange_order_id: &str, quantity: Decimal, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            exchange_order_id: exchange_order_id.to_string(),
            quantity,
            price,
            timestamp,
            cumulative_quantity: None,
            synthetic: false,
        }
    }

    pub fn key(&self) -> FillKey {
        FillKey {
            exchange_order_id: self.exchange_order_id.clone(),
            timestamp_ms: self.timestamp.timestamp_millis(),
            synthetic: self.synthetic,
        }
    }
}

/// Identity under which a fill is applied at most once
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FillKey {
    pub exchange_order_id: String,
    pub timestamp_ms: i64,
    /// Synthesized and reported fills never share a key
    #[serde(default)]
    pub synthetic: bool,
}
