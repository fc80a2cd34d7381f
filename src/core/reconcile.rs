// Reconciliation: diff the ledger against the exchange's open orders and repair drift

use std::collections::{HashMap, HashSet};

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::core::engine::{GridEngine, RiskGate, SyncReport};
use crate::core::events::{DriftKind, GridEvent};
use crate::core::ledger::GridLedger;
use crate::core::types::{ClientOrderId, FillEvent, LevelState, LiveOrder, OrderHandle};
use crate::error::{TradingError, TradingResult};

/// Retired orders are forgotten after this long
const RETIRED_RETENTION_HOURS: i64 = 24;

/// One disagreement between the ledger and the exchange
#[derive(Debug, Clone, PartialEq)]
pub enum Discrepancy {
    /// Open level whose order is not among the live orders
    MissingOrder { index: i64, handle: OrderHandle },
    /// Live order executed more than the ledger recorded
    MissedFill { index: i64, order: LiveOrder },
    /// Unacknowledged placement that is live on the exchange
    Adoptable { index: i64, order: LiveOrder },
    /// Unacknowledged placement with no live order
    Unconfirmed { index: i64 },
    /// Live order no level owns
    Orphan { order: LiveOrder },
    /// Cancel in flight whose order is already gone
    StaleCancel { index: i64 },
}

/// Compare the ledger with the exchange's open orders for the symbol
pub fn diff(ledger: &GridLedger, live: &[LiveOrder]) -> Vec<Discrepancy> {
    let by_exchange_id: HashMap<&str, &LiveOrder> = live
        .iter()
        .map(|order| (order.exchange_order_id.as_str(), order))
        .collect();
    let by_client_id: HashMap<&ClientOrderId, &LiveOrder> = live
        .iter()
        .filter_map(|order| order.client_order_id.as_ref().map(|id| (id, order)))
        .collect();

    let mut owned: HashSet<&str> = HashSet::new();
    let mut found = Vec::new();

    for level in ledger.levels() {
        let live_order = level
            .exchange_order_id
            .as_deref()
            .and_then(|id| by_exchange_id.get(id).copied())
            .or_else(|| level.client_order_id.as_ref().and_then(|id| by_client_id.get(id).copied()));

        match level.state {
            LevelState::Open => match live_order {
                Some(order) => {
                    owned.insert(order.exchange_order_id.as_str());
                    if order.executed_quantity > level.filled_quantity {
                        found.push(Discrepancy::MissedFill {
                            index: level.index,
                            order: order.clone(),
                        });
                    }
                }
                None => {
                    if let Some(handle) = level.handle() {
                        found.push(Discrepancy::MissingOrder {
                            index: level.index,
                            handle,
                        });
                    }
                }
            },
            LevelState::PendingOpen => match live_order {
                Some(order) => {
                    owned.insert(order.exchange_order_id.as_str());
                    found.push(Discrepancy::Adoptable {
                        index: level.index,
                        order: order.clone(),
                    });
                }
                None => found.push(Discrepancy::Unconfirmed { index: level.index }),
            },
            LevelState::PendingCancel => match live_order {
                Some(order) => {
                    owned.insert(order.exchange_order_id.as_str());
                }
                None => found.push(Discrepancy::StaleCancel { index: level.index }),
            },
            _ => {}
        }
    }

    for order in live {
        if !owned.contains(order.exchange_order_id.as_str()) {
            found.push(Discrepancy::Orphan { order: order.clone() });
        }
    }

    found
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub price: Decimal,
    pub live_orders: usize,
    pub discrepancies: usize,
    pub repaired: usize,
    pub errors: usize,
    /// Retired orders confirmed finished and forgotten
    pub retired_settled: usize,
    pub risk_gate: RiskGate,
    pub recentered: bool,
    pub sync: SyncReport,
}

pub struct Reconciler;

impl Reconciler {
    /// Fetch market and orders, repair drift, re-center if needed, then place missing levels
    pub async fn run_pass(engine: &mut GridEngine) -> TradingResult<ReconcileReport> {
        let price = engine.refresh_market().await?;
        let risk_gate = engine.evaluate_drawdown(price).await?;
        let live = engine.gateway().open_orders().await?;

        let discrepancies = diff(engine.ledger(), &live);
        let mut report = ReconcileReport {
            price,
            live_orders: live.len(),
            discrepancies: discrepancies.len(),
            risk_gate,
            ..ReconcileReport::default()
        };
        if !discrepancies.is_empty() {
            info!("🔎 Reconciliation found {} discrepancy(ies)", discrepancies.len());
        }

        for discrepancy in discrepancies {
            match Self::repair(engine, discrepancy).await {
                Ok(()) => report.repaired += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("⚠️  Repair failed [{}], retrying next pass: {}", e.category(), e);
                    report.errors += 1;
                }
            }
        }

        let retired: Vec<String> = engine.ledger().retired_orders().keys().cloned().collect();
        for exchange_order_id in retired {
            match Self::settle_retired(engine, &exchange_order_id).await {
                Ok(true) => report.retired_settled += 1,
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("⚠️  Retired order {} unresolved [{}]: {}", exchange_order_id, e.category(), e);
                    report.errors += 1;
                }
            }
        }

        let cutoff = Utc::now() - ChronoDuration::hours(RETIRED_RETENTION_HOURS);
        let pruned = engine.mutate(|l| Ok(l.prune_retired(cutoff)))?;
        if pruned > 0 {
            debug!("Forgot {} retired order(s)", pruned);
        }

        report.recentered = engine.maybe_recenter(price).await?;
        report.sync = engine.sync_orders(price).await?;
        Ok(report)
    }

    async fn repair(engine: &mut GridEngine, discrepancy: Discrepancy) -> TradingResult<()> {
        match discrepancy {
            Discrepancy::MissedFill { index, order } => {
                engine.catch_up_executions(index, &order).await?;
            }
            Discrepancy::MissingOrder { index, handle } => {
                let order = engine.gateway().query_order(&handle).await?;
                match order {
                    Some(order) if order.status.is_open() => {
                        debug!("Order on level {} reappeared as {:?}", index, order.status);
                    }
                    Some(order) => {
                        engine.catch_up_executions(index, &order).await?;
                        Self::release_if_open(
                            engine,
                            index,
                            &format!("order {} ended as {:?} on the exchange", order.exchange_order_id, order.status),
                        )?;
                    }
                    None => {
                        Self::release_if_open(engine, index, "order missing on the exchange")?;
                    }
                }
            }
            Discrepancy::Adoptable { index, order } => {
                engine.adopt_order(index, &order).await?;
            }
            Discrepancy::Unconfirmed { index } => {
                engine.resolve_pending_open(index).await?;
            }
            Discrepancy::Orphan { order } => {
                let handle = OrderHandle {
                    client_order_id: order
                        .client_order_id
                        .clone()
                        .unwrap_or_else(|| ClientOrderId::from(order.exchange_order_id.as_str())),
                    exchange_order_id: Some(order.exchange_order_id.clone()),
                };
                match engine.gateway().cancel_order(&handle).await {
                    Ok(()) | Err(TradingError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                engine.emit(GridEvent::DriftRepaired {
                    kind: DriftKind::OrphanOrder,
                    index: None,
                    detail: format!(
                        "cancelled untracked {} {} @ {} (order {})",
                        order.side, order.quantity, order.price, order.exchange_order_id
                    ),
                });
            }
            Discrepancy::StaleCancel { index } => {
                engine.mutate(|l| Ok(l.retire_level(index)))?;
                engine.emit(GridEvent::DriftRepaired {
                    kind: DriftKind::StaleCancel,
                    index: Some(index),
                    detail: "cancel confirmed by absence".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Ask the exchange how a retired order ended. Executions the fill feed
    /// never delivered are booked before the order is forgotten; a retired
    /// order that is still open stays retired.
    async fn settle_retired(engine: &mut GridEngine, exchange_order_id: &str) -> TradingResult<bool> {
        let handle = OrderHandle {
            client_order_id: ClientOrderId::from(exchange_order_id),
            exchange_order_id: Some(exchange_order_id.to_string()),
        };
        let order = match engine.gateway().query_order(&handle).await {
            Ok(order) => order,
            Err(TradingError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if let Some(order) = order {
            if order.status.is_open() {
                return Ok(false);
            }
            let Some(remaining) = engine
                .ledger()
                .retired_orders()
                .get(exchange_order_id)
                .map(|retired| retired.remaining)
            else {
                return Ok(false);
            };
            let missed = remaining - (order.quantity - order.executed_quantity).max(Decimal::ZERO);
            if missed > Decimal::ZERO {
                let mut fill = FillEvent::new(exchange_order_id, missed, order.price, Utc::now());
                fill.cumulative_quantity = Some(order.executed_quantity);
                fill.synthetic = true;
                engine.emit(GridEvent::DriftRepaired {
                    kind: DriftKind::MissedFill,
                    index: None,
                    detail: format!(
                        "retired order {} ended {:?} with {} executed, {} never reported",
                        exchange_order_id, order.status, order.executed_quantity, missed
                    ),
                });
                engine.on_fill(fill).await?;
            }
        }

        engine.mutate(|l| Ok(l.forget_retired(exchange_order_id)))?;
        Ok(true)
    }

    /// An Open level whose order is gone gets resubmitted on the next sync
    fn release_if_open(engine: &mut GridEngine, index: i64, reason: &str) -> TradingResult<()> {
        let still_open = engine
            .ledger()
            .level(index)
            .map(|level| level.state == LevelState::Open)
            .unwrap_or(false);
        if !still_open {
            return Ok(());
        }
        engine.mutate(|l| l.mark_failed(index, reason, true))?;
        engine.emit(GridEvent::DriftRepaired {
            kind: DriftKind::MissingOrder,
            index: Some(index),
            detail: reason.to_string(),
        });
        Ok(())
    }
}
