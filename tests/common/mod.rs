// Common test utilities and helpers
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use mexc_grid_bot::clients::{ExchangeGateway, PaperExchange};
use mexc_grid_bot::config::{Config, GatewayConfig, GridConfig, PersistenceBackend, PersistenceConfig};
use mexc_grid_bot::core::{FillOutcome, GracefulShutdown, GridEngine, LevelState, OrderSide, RecordingSink};
use mexc_grid_bot::db::{InMemorySnapshotStore, SnapshotStore};
use mexc_grid_bot::TradingResult;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

/// Bounds [90, 110], step 2, quantity 1: levels 0..=10 at 90, 92, ... 110
pub fn test_grid_config() -> GridConfig {
    GridConfig::arithmetic("BTCUSDT", dec!(90), dec!(110), dec!(2), dec!(1))
        .with_session_id("test-grid")
        .with_max_exposure(dec!(10))
}

/// Gateway settings that keep tests fast: no real backoff, generous rate limit
pub fn fast_gateway_config() -> GatewayConfig {
    GatewayConfig {
        requests_per_second: 10_000,
        burst: 10_000,
        max_queue_depth: 64,
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 5,
        fill_poll_interval_ms: 10,
        shutdown_timeout_secs: 1,
    }
}

/// Full config with a JSON store under `dir`
pub fn create_test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.grid = test_grid_config();
    config.gateway = fast_gateway_config();
    config.persistence = PersistenceConfig {
        backend: PersistenceBackend::Json,
        path: dir.path().join("snapshots").to_string_lossy().to_string(),
    };
    config
}

/// Create a temporary directory for test databases
pub fn create_temp_db_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");
    (temp_dir, db_path)
}

pub fn gateway_for(paper: &Arc<PaperExchange>) -> Arc<ExchangeGateway> {
    Arc::new(ExchangeGateway::new(
        paper.clone(),
        "BTCUSDT",
        &fast_gateway_config(),
        GracefulShutdown::new(),
    ))
}

/// Engine wired to a paper exchange and an in-memory store
pub struct Harness {
    pub engine: GridEngine,
    pub paper: Arc<PaperExchange>,
    pub store: Arc<InMemorySnapshotStore>,
    pub events: Arc<RecordingSink>,
}

impl Harness {
    pub fn new(config: GridConfig, price: Decimal) -> Self {
        let paper = Arc::new(PaperExchange::new("BTCUSDT", price));
        Self::with_parts(config, paper, Arc::new(InMemorySnapshotStore::new()))
    }

    pub fn with_parts(config: GridConfig, paper: Arc<PaperExchange>, store: Arc<InMemorySnapshotStore>) -> Self {
        let events = Arc::new(RecordingSink::new());
        let snapshot_store: Arc<dyn SnapshotStore> = store.clone();
        let engine = GridEngine::new(config, snapshot_store, gateway_for(&paper), events.clone())
            .expect("Failed to create engine");
        Self {
            engine,
            paper,
            store,
            events,
        }
    }

    /// Feed every execution the paper exchange reported since the last call
    pub async fn pump_fills(&mut self) -> TradingResult<Vec<FillOutcome>> {
        let fills = self.engine.gateway().poll_fills().await?;
        let mut outcomes = Vec::new();
        for fill in fills {
            outcomes.push(self.engine.on_fill(fill).await?);
        }
        Ok(outcomes)
    }

    /// Exchange order id held by a level
    pub fn order_id(&self, index: i64) -> String {
        self.engine
            .ledger()
            .level(index)
            .and_then(|level| level.exchange_order_id.clone())
            .unwrap_or_else(|| panic!("level {} has no order", index))
    }

    pub fn level_state(&self, index: i64) -> (LevelState, Option<OrderSide>) {
        let level = self.engine.ledger().level(index).expect("level exists");
        (level.state, level.side)
    }

    pub fn price_of(&self, index: i64) -> Decimal {
        self.engine.ledger().level(index).expect("level exists").price
    }
}
