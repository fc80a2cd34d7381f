// Integration tests for configuration loading and validation

mod common;

use common::create_test_config;
use mexc_grid_bot::config::PersistenceBackend;
use mexc_grid_bot::{Config, ConfigError, GridSpacing, RebalanceThreshold};
use rust_decimal_macros::dec;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_config_serialization_deserialization() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = create_test_config(&temp_dir);

    let toml_string = toml::to_string(&config).expect("Failed to serialize config");
    assert!(toml_string.contains("BTCUSDT"));
    assert!(toml_string.contains("mode = \"arithmetic\""));

    let deserialized: Config = toml::from_str(&toml_string).expect("Failed to deserialize config");
    assert_eq!(deserialized.grid, config.grid);
    assert_eq!(deserialized.persistence.backend, PersistenceBackend::Json);
    assert_eq!(deserialized.gateway.max_retries, config.gateway.max_retries);
}

#[test]
fn test_config_file_loading() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("config.toml");

    let config = create_test_config(&temp_dir);
    config.to_file(&config_path).expect("Failed to write config");

    let loaded = Config::from_file(&config_path).expect("Failed to load config");
    assert_eq!(loaded.grid.lower_bound, dec!(90));
    assert_eq!(loaded.grid.upper_bound, dec!(110));
    assert_eq!(loaded.grid.spacing, GridSpacing::Arithmetic { step: dec!(2) });
    assert_eq!(loaded.grid.layout().level_count(), 11);
}

#[test]
fn test_minimal_file_fills_defaults() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("config.toml");
    fs::write(
        &config_path,
        r#"
[grid]
session_id = "eth-1"
symbol = "ETHUSDT"
base_asset = "ETH"
quote_asset = "USDT"
lower_bound = "3000"
upper_bound = "3600"
quantity_per_level = "0.05"
max_open_orders = 20
max_exposure = "0.5"

[grid.spacing]
mode = "geometric"
ratio = "0.01"

[grid.rebalance_threshold]
kind = "absolute"
value = "50"
"#,
    )
    .unwrap();

    let config = Config::from_file(&config_path).expect("Failed to load config");

    assert_eq!(config.grid.spacing, GridSpacing::Geometric { ratio: dec!(0.01) });
    assert_eq!(config.grid.rebalance_threshold, RebalanceThreshold::Absolute { value: dec!(50) });
    assert_eq!(config.grid.tick_size, dec!(0.01));
    assert_eq!(config.grid.recenter_max_rounds, 3);
    assert_eq!(config.grid.min_notional, dec!(1));
    assert_eq!(config.grid.drawdown_pause_frac, None);
    assert_eq!(config.grid.kill_switch_frac, None);
    assert_eq!(config.persistence.backend, PersistenceBackend::Sqlite);
    assert!(config.logging.log_events);
}

#[test]
fn test_load_or_create_writes_default() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("new_config.toml");
    assert!(!config_path.exists());

    let created = Config::load_or_create(&config_path).expect("Failed to create config");
    assert!(config_path.exists());

    let reloaded = Config::load_or_create(&config_path).expect("Failed to reload config");
    assert_eq!(reloaded.grid, created.grid);
}

#[test]
fn test_invalid_config_is_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("bad.toml");

    let mut config = create_test_config(&temp_dir);
    config.grid.quantity_per_level = dec!(0);
    config.to_file(&config_path).unwrap();

    assert!(matches!(Config::from_file(&config_path), Err(ConfigError::Validation(_))));
}

#[test]
fn test_risk_limits_and_ladder_size_from_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("risk.toml");
    let grid = r#"
[grid]
session_id = "btc-risk"
symbol = "BTCUSDT"
base_asset = "BTC"
quote_asset = "USDT"
lower_bound = "60000"
upper_bound = "70000"
quantity_per_level = "0.001"
max_open_orders = 40
max_exposure = "0.02"
min_notional = "5"
drawdown_pause_frac = "0.1"
kill_switch_frac = "0.25"

[grid.rebalance_threshold]
kind = "percent"
value = "0.02"

[grid.spacing]
mode = "arithmetic"
"#;
    fs::write(&config_path, format!("{}step = \"100\"\n", grid)).unwrap();

    let config = Config::from_file(&config_path).expect("Failed to load config");
    assert_eq!(config.grid.min_notional, dec!(5));
    assert_eq!(config.grid.drawdown_pause_frac, Some(dec!(0.1)));
    assert_eq!(config.grid.kill_switch_frac, Some(dec!(0.25)));

    // A 1.0 step would need 10001 levels
    fs::write(&config_path, format!("{}step = \"1\"\n", grid)).unwrap();
    assert!(matches!(Config::from_file(&config_path), Err(ConfigError::Validation(_))));
}

#[test]
fn test_missing_and_malformed_files() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let missing = Config::from_file(temp_dir.path().join("nope.toml"));
    assert!(matches!(missing, Err(ConfigError::FileRead(_))));

    let path = temp_dir.path().join("broken.toml");
    fs::write(&path, "[grid\nsymbol = ").unwrap();
    assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse(_))));
}

#[test]
fn test_placeholder_keys_are_not_credentials() {
    let config = Config::default();
    assert!(!config.exchange.has_credentials());

    let mut configured = config.clone();
    configured.exchange.api_key = "mx0abc".to_string();
    configured.exchange.api_secret = "s3cret".to_string();
    assert!(configured.exchange.has_credentials());
}
