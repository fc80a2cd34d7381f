// MEXC Grid Trading Bot Library
//
// A grid of limit orders kept on the exchange by a persistent ledger, a
// strategy engine and a reconciliation loop that repairs drift

pub mod core;
pub mod clients;
pub mod config;
pub mod db;          // Snapshot stores (SQLite, JSON, in-memory)
pub mod error;       // Unified error handling
pub mod validation;  // Pre-flight validation

// Re-export core trading types
pub use core::{
    GridEngine, GridEvent, GridLedger, GridRunner, GridStatus, EventSink, FillEvent, OrderSide,
    Reconciler, RunnerOptions, TracingEventSink,
};

// Re-export error types
pub use error::{TradingError, TradingResult};

// Re-export validation types
pub use validation::{PreFlightValidator, ValidationResult, ValidationCheck, ValidationLevel};

// Re-export client types
pub use clients::{ExchangeApi, ExchangeGateway, MexcClient, PaperExchange};

// Re-export configuration
pub use config::{Config, ConfigError, GridConfig, GridSpacing, RebalanceThreshold};

// Re-export persistence types
pub use db::{open_store, Database, SnapshotStore};
