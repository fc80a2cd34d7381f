// Core trading logic modules

pub mod engine;
pub mod error_handling;
pub mod events;
pub mod layout;
pub mod ledger;
pub mod reconcile;
pub mod runner;
pub mod types;

// Re-export commonly used types
pub use engine::{GridEngine, GridStatus, RiskGate, SyncReport};
pub use error_handling::{GracefulShutdown, RetryPolicy};
pub use events::{DriftKind, EventSink, GridEvent, NullEventSink, RecordingSink, TracingEventSink};
pub use layout::GridLayout;
pub use ledger::{
    DesiredAction, FillOutcome, GridLedger, GridLevel, KillSwitch, LedgerSnapshot, LevelAction,
    PersistentLedger,
};
pub use reconcile::{diff, Discrepancy, ReconcileReport, Reconciler};
pub use runner::{GridRunner, RunnerOptions};
pub use types::{
    Balance, ClientOrderId, FillEvent, LevelState, LiveOrder, OrderHandle, OrderSide, OrderStatus,
    SymbolFilters,
};
