//! Pre-flight validation module for the grid bot
//!
//! Runs before `grid-bot run` to catch problems that would otherwise surface
//! as rejected orders or a halted engine: bad configuration, missing keys,
//! an unreachable exchange, a grid far from the market, missing funds or an
//! unwritable snapshot store.

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::clients::gateway::ExchangeApi;
use crate::config::Config;
use crate::core::ledger::GridLedger;
use crate::core::types::OrderSide;
use crate::db::open_store;
use crate::error::TradingError;

fn is_multiple(value: Decimal, unit: Decimal) -> bool {
    unit <= Decimal::ZERO || (value % unit).is_zero()
}

/// Validation result with detailed findings
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub passed: bool,
    pub checks: Vec<ValidationCheck>,
}

#[derive(Debug, Clone)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub level: ValidationLevel,
}

impl ValidationCheck {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
            level: ValidationLevel::Info,
        }
    }

    fn fail(name: &str, level: ValidationLevel, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
            level,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationLevel {
    Critical,  // Must pass for operation to proceed
    Warning,   // Should pass, but operation can continue
    Info,      // Informational only
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationResult {
    pub fn new() -> Self {
        ValidationResult {
            passed: true,
            checks: Vec::new(),
        }
    }

    pub fn add_check(&mut self, check: ValidationCheck) {
        if !check.passed && check.level == ValidationLevel::Critical {
            self.passed = false;
        }
        self.checks.push(check);
    }

    pub fn critical_failures(&self) -> Vec<&ValidationCheck> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.level == ValidationLevel::Critical)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&ValidationCheck> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.level == ValidationLevel::Warning)
            .collect()
    }

    pub fn check(&self, name: &str) -> Option<&ValidationCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn display(&self) {
        info!("🔍 Pre-flight Validation");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        for check in &self.checks {
            let icon = if check.passed {
                "✅"
            } else {
                match check.level {
                    ValidationLevel::Critical => "❌",
                    ValidationLevel::Warning => "⚠️",
                    ValidationLevel::Info => "ℹ️",
                }
            };

            info!("{} {} - {}", icon, check.name, check.message);
        }

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if !self.passed {
            let failures = self.critical_failures();
            error!("❌ Validation failed: {} critical issue(s)", failures.len());
            for failure in failures {
                error!("   • {}: {}", failure.name, failure.message);
            }
        } else {
            let warnings = self.warnings();
            if !warnings.is_empty() {
                warn!("⚠️  {} warning(s) detected", warnings.len());
                for warning in warnings {
                    warn!("   • {}: {}", warning.name, warning.message);
                }
            }
            info!("✅ All critical checks passed");
        }
    }
}

/// Pre-flight validator for a grid session
pub struct PreFlightValidator {
    config: Config,
}

impl PreFlightValidator {
    pub fn new(config: Config) -> Self {
        PreFlightValidator { config }
    }

    /// Checks that need no exchange access
    pub fn validate_offline(&self, live: bool) -> ValidationResult {
        let mut result = ValidationResult::new();
        result.add_check(self.check_config());
        result.add_check(self.check_credentials(live));
        if result.passed {
            result.add_check(self.check_grid_shape());
        }
        result.add_check(self.check_persistence());
        result
    }

    /// Full suite against the exchange the session will trade on
    pub async fn validate_for_trading(&self, exchange: &dyn ExchangeApi, live: bool) -> ValidationResult {
        let mut result = self.validate_offline(live);
        if !result.passed {
            return result;
        }

        match exchange.ticker_price(&self.config.grid.symbol).await {
            Ok(price) => {
                result.add_check(ValidationCheck::pass(
                    "Exchange",
                    format!("{} reachable, {} at {}", exchange.name(), self.config.grid.symbol, price),
                ));
                result.add_check(self.check_symbol_filters(exchange).await);
                result.add_check(self.check_price_in_reach(price));
                result.add_check(self.check_funds(exchange, price).await);
            }
            Err(e) => {
                result.add_check(ValidationCheck::fail(
                    "Exchange",
                    ValidationLevel::Critical,
                    format!("cannot fetch {} price from {}: {}", self.config.grid.symbol, exchange.name(), e),
                ));
            }
        }

        result
    }

    // Individual check methods

    fn check_config(&self) -> ValidationCheck {
        match self.config.validate() {
            Ok(()) => ValidationCheck::pass("Configuration", "Loaded successfully"),
            Err(e) => ValidationCheck::fail("Configuration", ValidationLevel::Critical, e.to_string()),
        }
    }

    fn check_credentials(&self, live: bool) -> ValidationCheck {
        if self.config.exchange.has_credentials() {
            return ValidationCheck::pass("API Keys", "Configured");
        }
        // Only live trading signs requests
        let level = if live { ValidationLevel::Critical } else { ValidationLevel::Warning };
        ValidationCheck::fail(
            "API Keys",
            level,
            "Not configured (set [exchange] keys or MEXC_API_KEY / MEXC_API_SECRET)",
        )
    }

    fn check_grid_shape(&self) -> ValidationCheck {
        let grid = &self.config.grid;
        let layout = grid.layout();
        let levels = layout.level_count();
        let message = format!(
            "{} levels from {} to {}, {} {} per level",
            levels,
            layout.lower_bound(),
            layout.upper_bound(),
            grid.quantity_per_level,
            grid.base_asset
        );

        if levels > grid.max_open_orders + 1 {
            ValidationCheck::fail(
                "Grid Shape",
                ValidationLevel::Warning,
                format!("{}; only {} will hold orders at a time", message, grid.max_open_orders),
            )
        } else {
            ValidationCheck::pass("Grid Shape", message)
        }
    }

    /// The grid's ticks, quantity and smallest order must satisfy the exchange's rules
    async fn check_symbol_filters(&self, exchange: &dyn ExchangeApi) -> ValidationCheck {
        let grid = &self.config.grid;
        let filters = match exchange.symbol_filters(&grid.symbol).await {
            Ok(filters) => filters,
            Err(e @ TradingError::NotFound(_)) => {
                return ValidationCheck::fail("Symbol Rules", ValidationLevel::Critical, e.to_string());
            }
            Err(e) => {
                return ValidationCheck::fail(
                    "Symbol Rules",
                    ValidationLevel::Warning,
                    format!("trading rules unavailable, using configured tick and step: {}", e),
                );
            }
        };

        let quantity = GridLedger::new(grid).order_quantity();
        let smallest_notional = grid.layout().lower_bound() * quantity;
        let mut problems = Vec::new();
        if !filters.is_trading() {
            problems.push(format!("{} is not trading (status {})", filters.symbol, filters.status));
        }
        if !is_multiple(grid.tick_size, filters.tick_size) {
            problems.push(format!("tick_size {} is not a multiple of the exchange tick {}", grid.tick_size, filters.tick_size));
        }
        if !is_multiple(grid.qty_step, filters.qty_step) {
            problems.push(format!("qty_step {} is not a multiple of the exchange step {}", grid.qty_step, filters.qty_step));
        }
        if quantity < filters.min_qty {
            problems.push(format!("order quantity {} is below the exchange minimum {}", quantity, filters.min_qty));
        }
        if smallest_notional < filters.min_notional {
            problems.push(format!(
                "orders near {} are worth {}, below the exchange minimum notional {}",
                grid.layout().lower_bound(),
                smallest_notional,
                filters.min_notional
            ));
        }
        if !problems.is_empty() {
            return ValidationCheck::fail("Symbol Rules", ValidationLevel::Critical, problems.join("; "));
        }

        if grid.min_notional < filters.min_notional {
            return ValidationCheck::fail(
                "Symbol Rules",
                ValidationLevel::Warning,
                format!(
                    "min_notional {} is below the exchange's {}; raise it so re-centered levels are skipped locally",
                    grid.min_notional, filters.min_notional
                ),
            );
        }

        ValidationCheck::pass(
            "Symbol Rules",
            format!(
                "tick {}, step {}, min notional {}",
                filters.tick_size, filters.qty_step, filters.min_notional
            ),
        )
    }

    fn check_price_in_reach(&self, price: Decimal) -> ValidationCheck {
        let layout = self.config.grid.layout();
        let lower = layout.lower_bound();
        let upper = layout.upper_bound();
        if price >= lower && price <= upper {
            return ValidationCheck::pass("Price Range", format!("{} inside {} .. {}", price, lower, upper));
        }

        let threshold = self.config.grid.rebalance_threshold;
        let recenters = price > upper + threshold.distance_from(upper) || price < lower - threshold.distance_from(lower);
        let message = if recenters {
            format!("{} outside {} .. {}, the grid will re-center on start", price, lower, upper)
        } else {
            format!("{} outside {} .. {}, only one side of the grid will trade", price, lower, upper)
        };
        ValidationCheck::fail("Price Range", ValidationLevel::Warning, message)
    }

    /// Funds needed for the orders the first sync would place
    async fn check_funds(&self, exchange: &dyn ExchangeApi, price: Decimal) -> ValidationCheck {
        let grid = &self.config.grid;
        let ledger = GridLedger::new(grid);
        let quantity = ledger.order_quantity();

        let (mut quote_needed, mut base_needed) = (Decimal::ZERO, Decimal::ZERO);
        for action in ledger.levels_needing_action(price) {
            match action.action.side() {
                OrderSide::Buy => quote_needed += action.price * quantity,
                OrderSide::Sell => base_needed += quantity,
            }
        }

        let balances = match exchange.balances().await {
            Ok(balances) => balances,
            Err(e) => {
                return ValidationCheck::fail("Funds", ValidationLevel::Warning, format!("balances unavailable: {}", e));
            }
        };
        let free = |asset: &str| {
            balances
                .iter()
                .find(|b| b.asset == asset)
                .map(|b| b.free)
                .unwrap_or(Decimal::ZERO)
        };
        let quote_free = free(&grid.quote_asset);
        let base_free = free(&grid.base_asset);

        let mut short = Vec::new();
        if quote_free < quote_needed {
            short.push(format!("{} {} (have {})", quote_needed, grid.quote_asset, quote_free));
        }
        if base_free < base_needed {
            short.push(format!("{} {} (have {})", base_needed, grid.base_asset, base_free));
        }

        if short.is_empty() {
            ValidationCheck::pass(
                "Funds",
                format!("{} {} and {} {} cover the initial grid", quote_free, grid.quote_asset, base_free, grid.base_asset),
            )
        } else {
            ValidationCheck::fail(
                "Funds",
                ValidationLevel::Warning,
                format!("initial grid needs {}; unfunded levels will be skipped", short.join(" and ")),
            )
        }
    }

    fn check_persistence(&self) -> ValidationCheck {
        let store = match open_store(&self.config.persistence) {
            Ok(store) => store,
            Err(e) => {
                return ValidationCheck::fail("Persistence", ValidationLevel::Critical, format!("cannot open store: {}", e));
            }
        };

        match store.sessions() {
            Ok(sessions) if sessions.contains(&self.config.grid.session_id) => ValidationCheck::pass(
                "Persistence",
                format!("Healthy, session {} will be resumed", self.config.grid.session_id),
            ),
            Ok(_) => ValidationCheck::pass(
                "Persistence",
                format!("Healthy, session {} will start fresh", self.config.grid.session_id),
            ),
            Err(e) => ValidationCheck::fail("Persistence", ValidationLevel::Critical, format!("store unreadable: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::paper::PaperExchange;
    use crate::config::{PersistenceBackend, PersistenceConfig};
    use crate::core::types::SymbolFilters;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.grid = crate::config::GridConfig::arithmetic("BTCUSDT", dec!(90), dec!(110), dec!(2), dec!(1))
            .with_max_exposure(dec!(10));
        config.persistence = PersistenceConfig {
            backend: PersistenceBackend::Json,
            path: dir.path().join("snapshots").to_string_lossy().to_string(),
        };
        config
    }

    #[test]
    fn test_validation_result() {
        let mut result = ValidationResult::new();
        assert!(result.passed);

        result.add_check(ValidationCheck::pass("Test", "OK"));
        assert!(result.passed);

        result.add_check(ValidationCheck::fail("Fail", ValidationLevel::Critical, "Failed"));
        assert!(!result.passed);
        assert_eq!(result.critical_failures().len(), 1);
    }

    #[test]
    fn test_missing_keys_only_block_live_trading() {
        let dir = TempDir::new().unwrap();
        let validator = PreFlightValidator::new(config_in(&dir));

        assert!(validator.validate_offline(false).passed);
        assert!(!validator.validate_offline(true).passed);
    }

    #[test]
    fn test_invalid_bounds_are_critical() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.grid.upper_bound = dec!(80);

        let result = PreFlightValidator::new(config).validate_offline(false);
        assert!(!result.passed);
        assert!(result.check("Grid Shape").is_none());
    }

    #[tokio::test]
    async fn test_funds_warning_against_paper_exchange() {
        let dir = TempDir::new().unwrap();
        let validator = PreFlightValidator::new(config_in(&dir));
        let exchange = PaperExchange::new("BTCUSDT", dec!(100))
            .with_balance("USDT", dec!(100))
            .with_balance("BTC", dec!(10));

        let result = validator.validate_for_trading(&exchange, false).await;
        assert!(result.passed);
        assert!(result.check("Price Range").unwrap().passed);

        let funds = result.check("Funds").unwrap();
        assert!(!funds.passed);
        assert_eq!(funds.level, ValidationLevel::Warning);
    }

    #[tokio::test]
    async fn test_symbol_rules_against_exchange_filters() {
        let dir = TempDir::new().unwrap();
        let validator = PreFlightValidator::new(config_in(&dir));
        let filters = SymbolFilters {
            symbol: "BTCUSDT".to_string(),
            status: "1".to_string(),
            tick_size: dec!(0.01),
            qty_step: dec!(0.000001),
            min_qty: dec!(0.000001),
            min_notional: dec!(5),
        };

        let exchange = PaperExchange::new("BTCUSDT", dec!(100)).with_filters(filters.clone());
        let result = validator.validate_for_trading(&exchange, false).await;
        assert!(result.passed);
        let rules = result.check("Symbol Rules").unwrap();
        assert_eq!(rules.level, ValidationLevel::Warning);
        assert!(rules.message.contains("min_notional"));

        let coarse = SymbolFilters {
            tick_size: dec!(0.1),
            min_notional: dec!(100),
            ..filters
        };
        let exchange = PaperExchange::new("BTCUSDT", dec!(100)).with_filters(coarse);
        let result = validator.validate_for_trading(&exchange, false).await;
        assert!(!result.passed);
        let rules = result.check("Symbol Rules").unwrap();
        assert!(rules.message.contains("tick_size"));
        assert!(rules.message.contains("minimum notional 100"));
    }

    #[tokio::test]
    async fn test_far_price_warns_about_recentering() {
        let dir = TempDir::new().unwrap();
        let validator = PreFlightValidator::new(config_in(&dir));
        let exchange = PaperExchange::new("BTCUSDT", dec!(150));

        let result = validator.validate_for_trading(&exchange, false).await;
        let range = result.check("Price Range").unwrap();
        assert!(!range.passed);
        assert!(range.message.contains("re-center"));
    }
}
