// Configuration management for the grid bot

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::layout::{GridLayout, MAX_LEVELS};

/// Static description of one grid session. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Key under which the ledger snapshot is persisted
    pub session_id: String,
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub lower_bound: Decimal,
    pub upper_bound: Decimal,
    pub spacing: GridSpacing,
    pub quantity_per_level: Decimal,
    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,
    #[serde(default = "default_qty_step")]
    pub qty_step: Decimal,
    pub rebalance_threshold: RebalanceThreshold,
    pub max_open_orders: usize,
    /// Max filled-but-unhedged base quantity
    pub max_exposure: Decimal,
    /// Quote notional this grid may lock in open buys
    #[serde(default)]
    pub quote_allocation: Option<Decimal>,
    /// Base quantity this grid may lock in open sells
    #[serde(default)]
    pub base_allocation: Option<Decimal>,
    /// Smallest order notional (price * quantity) worth placing
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// Account drawdown from its peak above which new buys pause, e.g. 0.1
    #[serde(default)]
    pub drawdown_pause_frac: Option<Decimal>,
    /// Drawdown above which placement stops until reset by an operator
    #[serde(default)]
    pub kill_switch_frac: Option<Decimal>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_recenter_rounds")]
    pub recenter_max_rounds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GridSpacing {
    /// Fixed price distance between levels
    Arithmetic { step: Decimal },
    /// Fixed ratio between levels, e.g. 0.01 for 1%
    Geometric { ratio: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RebalanceThreshold {
    /// Price distance beyond the bound
    Absolute { value: Decimal },
    /// Fraction of the crossed bound, e.g. 0.02 for 2%
    Percent { value: Decimal },
}

impl RebalanceThreshold {
    /// Distance past `bound` that triggers re-centering
    pub fn distance_from(&self, bound: Decimal) -> Decimal {
        match self {
            RebalanceThreshold::Absolute { value } => *value,
            RebalanceThreshold::Percent { value } => bound * *value,
        }
    }
}

impl GridConfig {
    /// Arithmetic grid with conservative defaults for everything else
    pub fn arithmetic(
        symbol: &str,
        lower_bound: Decimal,
        upper_bound: Decimal,
        step: Decimal,
        quantity_per_level: Decimal,
    ) -> Self {
        let (base_asset, quote_asset) = split_symbol(symbol);
        Self {
            session_id: format!("{}-grid", symbol.to_lowercase()),
            symbol: symbol.to_string(),
            base_asset,
            quote_asset,
            lower_bound,
            upper_bound,
            spacing: GridSpacing::Arithmetic { step },
            quantity_per_level,
            tick_size: default_tick_size(),
            qty_step: default_qty_step(),
            rebalance_threshold: RebalanceThreshold::Percent { value: dec!(0.02) },
            max_open_orders: 100,
            max_exposure: quantity_per_level * Decimal::from(100),
            quote_allocation: None,
            base_allocation: None,
            min_notional: default_min_notional(),
            drawdown_pause_frac: None,
            kill_switch_frac: None,
            poll_interval_secs: default_poll_interval(),
            recenter_max_rounds: default_recenter_rounds(),
        }
    }

    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.session_id = session_id.to_string();
        self
    }

    pub fn with_spacing(mut self, spacing: GridSpacing) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn with_max_exposure(mut self, max_exposure: Decimal) -> Self {
        self.max_exposure = max_exposure;
        self
    }

    pub fn with_max_open_orders(mut self, max_open_orders: usize) -> Self {
        self.max_open_orders = max_open_orders;
        self
    }

    pub fn with_min_notional(mut self, min_notional: Decimal) -> Self {
        self.min_notional = min_notional;
        self
    }

    pub fn with_drawdown_limits(mut self, pause: Option<Decimal>, kill_switch: Option<Decimal>) -> Self {
        self.drawdown_pause_frac = pause;
        self.kill_switch_frac = kill_switch;
        self
    }

    pub fn with_rebalance_threshold(mut self, threshold: RebalanceThreshold) -> Self {
        self.rebalance_threshold = threshold;
        self
    }

    /// Price ladder described by this config
    pub fn layout(&self) -> GridLayout {
        GridLayout::from_bounds(self.lower_bound, self.upper_bound, self.spacing, self.tick_size)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_id.trim().is_empty() {
            return Err(ConfigError::Validation("session_id must not be empty".to_string()));
        }

        if self.symbol.trim().is_empty() {
            return Err(ConfigError::Validation("symbol must not be empty".to_string()));
        }

        if self.lower_bound <= Decimal::ZERO || self.upper_bound <= self.lower_bound {
            return Err(ConfigError::Validation(format!(
                "bounds must satisfy 0 < lower_bound < upper_bound (got {} .. {})",
                self.lower_bound, self.upper_bound
            )));
        }

        match self.spacing {
            GridSpacing::Arithmetic { step } if step <= Decimal::ZERO => {
                return Err(ConfigError::Validation("spacing.step must be positive".to_string()));
            }
            GridSpacing::Geometric { ratio } if ratio <= Decimal::ZERO => {
                return Err(ConfigError::Validation("spacing.ratio must be positive".to_string()));
            }
            _ => {}
        }

        if self.quantity_per_level <= Decimal::ZERO {
            return Err(ConfigError::Validation("quantity_per_level must be positive".to_string()));
        }

        if self.tick_size <= Decimal::ZERO || self.qty_step <= Decimal::ZERO {
            return Err(ConfigError::Validation("tick_size and qty_step must be positive".to_string()));
        }

        let threshold = match self.rebalance_threshold {
            RebalanceThreshold::Absolute { value } | RebalanceThreshold::Percent { value } => value,
        };
        if threshold < Decimal::ZERO {
            return Err(ConfigError::Validation("rebalance_threshold must be non-negative".to_string()));
        }

        if self.max_open_orders == 0 {
            return Err(ConfigError::Validation("max_open_orders must be greater than 0".to_string()));
        }

        if self.max_exposure < Decimal::ZERO {
            return Err(ConfigError::Validation("max_exposure must be non-negative".to_string()));
        }

        if self.min_notional < Decimal::ZERO {
            return Err(ConfigError::Validation("min_notional must be non-negative".to_string()));
        }

        for (name, fraction) in [
            ("drawdown_pause_frac", self.drawdown_pause_frac),
            ("kill_switch_frac", self.kill_switch_frac),
        ] {
            if let Some(fraction) = fraction {
                if fraction <= Decimal::ZERO || fraction >= Decimal::ONE {
                    return Err(ConfigError::Validation(format!(
                        "{} must lie between 0 and 1 (got {})",
                        name, fraction
                    )));
                }
            }
        }
        if let (Some(pause), Some(kill)) = (self.drawdown_pause_frac, self.kill_switch_frac) {
            if kill <= pause {
                return Err(ConfigError::Validation(format!(
                    "kill_switch_frac {} must exceed drawdown_pause_frac {}",
                    kill, pause
                )));
            }
        }

        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Validation("poll_interval_secs must be greater than 0".to_string()));
        }

        let layout = self.layout();
        if layout.level_count() < 2 {
            return Err(ConfigError::Validation(format!(
                "spacing yields {} level(s) between the bounds; at least 2 are required",
                layout.level_count()
            )));
        }

        let next = layout.price_at(layout.last_index() + 1);
        if layout.level_count() >= MAX_LEVELS && next.is_some_and(|price| price <= self.upper_bound) {
            return Err(ConfigError::Validation(format!(
                "spacing yields more than {} levels between {} and {}; widen the spacing or narrow the bounds",
                MAX_LEVELS, self.lower_bound, self.upper_bound
            )));
        }

        let steps = layout.prices();
        if steps.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::Validation(
                "spacing is finer than tick_size; adjacent levels collapse to the same price".to_string(),
            ));
        }

        Ok(())
    }
}

/// Split "BTCUSDT" into ("BTC", "USDT") using common quote currencies
pub fn split_symbol(symbol: &str) -> (String, String) {
    const QUOTES: [&str; 5] = ["USDT", "USDC", "BTC", "ETH", "USD"];
    let upper = symbol.to_uppercase();
    for quote in QUOTES {
        if upper.len() > quote.len() && upper.ends_with(quote) {
            let base = &upper[..upper.len() - quote.len()];
            return (base.to_string(), quote.to_string());
        }
    }
    (upper, String::new())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_recv_window")]
    pub recv_window_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ExchangeConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty()
            && !self.api_secret.is_empty()
            && !self.api_key.starts_with("YOUR_")
            && !self.api_secret.starts_with("YOUR_")
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            api_key: "YOUR_MEXC_API_KEY".to_string(),
            api_secret: "YOUR_MEXC_API_SECRET".to_string(),
            recv_window_ms: default_recv_window(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Token refill rate of the local rate limiter
    pub requests_per_second: u32,
    /// Bucket capacity
    pub burst: u32,
    /// Calls allowed to wait for a token before RateLimited is returned
    pub max_queue_depth: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub fill_poll_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst: 20,
            max_queue_depth: 64,
            max_retries: 4,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            fill_poll_interval_ms: 1_000,
            shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    Sqlite,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// SQLite database file or directory of JSON snapshots
    pub path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Sqlite,
            path: "data/grid.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_events: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub grid: GridConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grid: GridConfig::arithmetic("BTCUSDT", dec!(60000), dec!(70000), dec!(500), dec!(0.0002))
                .with_max_exposure(dec!(0.004))
                .with_max_open_orders(20),
            exchange: ExchangeConfig::default(),
            gateway: GatewayConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(e.to_string()))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.to_file(&path)?;
            tracing::info!("📁 Created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    /// Credentials from the environment win over the file
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("MEXC_API_KEY") {
            if !key.is_empty() {
                self.exchange.api_key = key;
            }
        }
        if let Ok(secret) = std::env::var("MEXC_API_SECRET") {
            if !secret.is_empty() {
                self.exchange.api_secret = secret;
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.grid.validate()?;

        if self.gateway.requests_per_second == 0 || self.gateway.burst == 0 {
            return Err(ConfigError::Validation(
                "gateway.requests_per_second and gateway.burst must be greater than 0".to_string(),
            ));
        }

        if self.gateway.base_delay_ms > self.gateway.max_delay_ms {
            return Err(ConfigError::Validation(
                "gateway.base_delay_ms must not exceed gateway.max_delay_ms".to_string(),
            ));
        }

        if self.persistence.path.trim().is_empty() {
            return Err(ConfigError::Validation("persistence.path must not be empty".to_string()));
        }

        Ok(())
    }
}

// Default value functions
fn default_tick_size() -> Decimal { dec!(0.01) }
fn default_qty_step() -> Decimal { dec!(0.000001) }
fn default_min_notional() -> Decimal { dec!(1) }
fn default_poll_interval() -> u64 { 10 }
fn default_recenter_rounds() -> u32 { 3 }
fn default_rest_url() -> String { "https://api.mexc.com".to_string() }
fn default_recv_window() -> u64 { 5000 }
fn default_request_timeout() -> u64 { 10 }

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}
