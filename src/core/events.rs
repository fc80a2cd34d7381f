// Events emitted by the engine and reconciliation for observers

use std::sync::Mutex;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::core::types::OrderSide;

#[derive(Debug, Clone, PartialEq)]
pub enum GridEvent {
    OrderPlaced {
        index: i64,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        exchange_order_id: Option<String>,
    },
    OrderCancelled {
        index: i64,
        exchange_order_id: Option<String>,
    },
    OrderFilled {
        index: Option<i64>,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        complete: bool,
        synthetic: bool,
    },
    PlacementFailed {
        index: i64,
        side: OrderSide,
        reason: String,
        retryable: bool,
    },
    ExposureCapped {
        index: i64,
        committed: Decimal,
        requested: Decimal,
        limit: Decimal,
    },
    InsufficientFunds {
        index: i64,
        asset: String,
        required: Decimal,
        available: Decimal,
    },
    BelowMinNotional {
        index: i64,
        notional: Decimal,
        minimum: Decimal,
    },
    /// Drawdown above the pause limit: buys are held back
    DrawdownPaused {
        drawdown: Decimal,
        limit: Decimal,
    },
    DrawdownResumed {
        drawdown: Decimal,
    },
    /// Drawdown above the kill limit: placement stops until an operator resets it
    KillSwitchTripped {
        drawdown: Decimal,
        limit: Decimal,
        cancelled: usize,
    },
    KillSwitchReset,
    DuplicateFill {
        exchange_order_id: String,
    },
    UnknownFill {
        exchange_order_id: String,
    },
    DriftRepaired {
        kind: DriftKind,
        index: Option<i64>,
        detail: String,
    },
    Recentered {
        shift: i64,
        lower: Decimal,
        upper: Decimal,
    },
    RecenterAborted {
        unconfirmed: usize,
    },
    PersistenceHalted {
        reason: String,
    },
    PersistenceRecovered,
    ShutdownStarted,
    ShutdownComplete {
        position: Decimal,
        realized_pnl: Decimal,
    },
}

/// What kind of disagreement between the ledger and the exchange was repaired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftKind {
    MissedFill,
    MissingOrder,
    OrphanOrder,
    AdoptedOrder,
    StaleCancel,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: GridEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: GridEvent) {
        match event {
            GridEvent::OrderPlaced { index, side, price, quantity, exchange_order_id } => {
                info!(
                    "📝 {} {} @ {} on level {} (order {})",
                    side,
                    quantity,
                    price,
                    index,
                    exchange_order_id.as_deref().unwrap_or("-")
                );
            }
            GridEvent::OrderCancelled { index, exchange_order_id } => {
                info!("🗑️  Cancelled level {} (order {})", index, exchange_order_id.as_deref().unwrap_or("-"));
            }
            GridEvent::OrderFilled { index, side, price, quantity, complete, synthetic } => {
                let origin = if synthetic { " [reconciled]" } else { "" };
                let level = index.map(|i| i.to_string()).unwrap_or_else(|| "retired".to_string());
                if complete {
                    info!("✅ {} filled {} @ {} on level {}{}", side, quantity, price, level, origin);
                } else {
                    info!("🧩 {} partially filled {} @ {} on level {}{}", side, quantity, price, level, origin);
                }
            }
            GridEvent::PlacementFailed { index, side, reason, retryable } => {
                if retryable {
                    warn!("⚠️  {} on level {} failed, will retry: {}", side, index, reason);
                } else {
                    error!("❌ {} on level {} failed: {}", side, index, reason);
                }
            }
            GridEvent::ExposureCapped { index, committed, requested, limit } => {
                warn!(
                    "🛡️  Buy on level {} skipped: exposure {} + {} would exceed {}",
                    index, committed, requested, limit
                );
            }
            GridEvent::InsufficientFunds { index, asset, required, available } => {
                warn!(
                    "💸 Level {} skipped: needs {} {}, {} available",
                    index, required, asset, available
                );
            }
            GridEvent::BelowMinNotional { index, notional, minimum } => {
                warn!("📏 Level {} skipped: notional {} below minimum {}", index, notional, minimum);
            }
            GridEvent::DrawdownPaused { drawdown, limit } => {
                warn!("⏸️  Drawdown {} above {}, new buys paused", drawdown.round_dp(4), limit);
            }
            GridEvent::DrawdownResumed { drawdown } => {
                info!("▶️  Drawdown back to {}, buys resumed", drawdown.round_dp(4));
            }
            GridEvent::KillSwitchTripped { drawdown, limit, cancelled } => {
                error!(
                    "🚨 Kill switch: drawdown {} above {}, {} buy(s) cancelled, placement stopped",
                    drawdown.round_dp(4),
                    limit,
                    cancelled
                );
            }
            GridEvent::KillSwitchReset => {
                info!("🔓 Kill switch reset by operator");
            }
            GridEvent::DuplicateFill { exchange_order_id } => {
                tracing::debug!("🔁 Duplicate fill for order {} ignored", exchange_order_id);
            }
            GridEvent::UnknownFill { exchange_order_id } => {
                warn!("❓ Fill for untracked order {}", exchange_order_id);
            }
            GridEvent::DriftRepaired { kind, index, detail } => {
                warn!(
                    "🔧 Repaired {:?} on level {}: {}",
                    kind,
                    index.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string()),
                    detail
                );
            }
            GridEvent::Recentered { shift, lower, upper } => {
                info!("🎯 Grid re-centered by {} levels, now {} .. {}", shift, lower, upper);
            }
            GridEvent::RecenterAborted { unconfirmed } => {
                warn!("↩️  Re-centering rolled back, {} cancel(s) unconfirmed", unconfirmed);
            }
            GridEvent::PersistenceHalted { reason } => {
                error!("🚨 Ledger flush failed, order placement halted: {}", reason);
            }
            GridEvent::PersistenceRecovered => {
                info!("💾 Ledger flush succeeded, order placement resumed");
            }
            GridEvent::ShutdownStarted => {
                info!("🛑 Graceful shutdown initiated");
            }
            GridEvent::ShutdownComplete { position, realized_pnl } => {
                info!("👋 Shutdown complete. Position {}, realized P&L {}", position, realized_pnl);
            }
        }
    }
}

/// Drops every event
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: GridEvent) {}
}

/// Keeps events in memory for inspection
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GridEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GridEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&GridEvent) -> bool,
    {
        self.events().iter().filter(|event| predicate(event)).count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: GridEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.emit(GridEvent::ShutdownStarted);
        sink.emit(GridEvent::PersistenceRecovered);
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.count(|e| matches!(e, GridEvent::ShutdownStarted)), 1);
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
