//! Unified error handling for the grid bot
//!
//! One error type flows from the exchange transports up through the gateway,
//! the engine and the CLI. Variants follow the failure classes the engine
//! reacts to differently: transient transport failures are retried inside
//! the gateway, structural ones (rejections, drift) are repaired and
//! reported, fatal ones (persistence, configuration) stop order placement.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for the grid bot
#[derive(Debug, Clone, Error)]
pub enum TradingError {
    // Transport errors
    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Exchange throttled the request: {0}")]
    Throttled(String),

    #[error("Local rate limit queue is full ({queued} waiting)")]
    RateLimited { queued: usize },

    // Order errors
    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Duplicate client order id: {0}")]
    DuplicateOrder(String),

    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Fill for untracked order: {0}")]
    UnknownOrder(String),

    #[error("Ledger drift: {0}")]
    Drift(String),

    // Risk errors
    #[error("Insufficient funds: required {required} {asset}, available {available}")]
    InsufficientFunds {
        asset: String,
        required: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    #[error("Exposure cap reached: {committed} committed + {requested} requested > {limit}")]
    ExposureCapped {
        committed: rust_decimal::Decimal,
        requested: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    #[error("Order notional {notional} is below the minimum {minimum}")]
    BelowMinNotional {
        notional: rust_decimal::Decimal,
        minimum: rust_decimal::Decimal,
    },

    // Fatal errors
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Shutting down, no new orders accepted")]
    ShuttingDown,

    // General errors
    #[error("Failed to decode exchange response: {0}")]
    Decode(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TradingError {
    /// Get a user-friendly error message with helpful context
    pub fn user_message(&self) -> String {
        match self {
            TradingError::ConfigurationInvalid(msg) => {
                format!(
                    "Configuration error: {}\n\n\
                    💡 Check config.toml for:\n\
                    - Bounds with lower_bound < upper_bound\n\
                    - Positive quantity, tick size and spacing\n\
                    - The same grid layout as the persisted session (or a new session_id)",
                    msg
                )
            }
            TradingError::PersistenceFailure(msg) => {
                format!(
                    "Ledger could not be persisted: {}\n\n\
                    💡 Order placement is halted until the store is writable again.\n\
                    Check disk space and permissions of the persistence path.",
                    msg
                )
            }
            TradingError::InsufficientFunds { asset, required, available } => {
                format!(
                    "Insufficient {} balance\n\
                    Required: {}\n\
                    Available: {}\n\n\
                    💡 Either top up the account or reduce quantity_per_level",
                    asset, required, available
                )
            }
            TradingError::Throttled(_) | TradingError::RateLimited { .. } => {
                format!(
                    "{}\n\n\
                    💡 Lower [gateway].requests_per_second or raise max_queue_depth",
                    self
                )
            }
            _ => self.to_string(),
        }
    }

    /// Check if the gateway should retry the call that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TradingError::TransientNetwork(_) | TradingError::Throttled(_)
        )
    }

    /// Whether a level that failed with this error may be retried automatically
    pub fn is_recoverable(&self) -> bool {
        self.is_retryable()
            || matches!(
                self,
                TradingError::RateLimited { .. }
                    | TradingError::InsufficientFunds { .. }
                    | TradingError::PersistenceFailure(_)
            )
    }

    /// Errors after which the engine must stop placing orders
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TradingError::PersistenceFailure(_) | TradingError::ConfigurationInvalid(_)
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::TransientNetwork(_)
            | TradingError::Throttled(_)
            | TradingError::RateLimited { .. }
            | TradingError::Decode(_) => "network",

            TradingError::Rejected(_)
            | TradingError::DuplicateOrder(_)
            | TradingError::NotFound(_) => "order",

            TradingError::UnknownOrder(_) | TradingError::Drift(_) => "drift",

            TradingError::InsufficientFunds { .. }
            | TradingError::ExposureCapped { .. }
            | TradingError::BelowMinNotional { .. } => "risk",

            TradingError::PersistenceFailure(_) => "persistence",
            TradingError::ConfigurationInvalid(_) => "config",

            TradingError::ShuttingDown | TradingError::Internal(_) => "internal",
        }
    }

    /// Suggested pause before retrying, when the error carries one
    pub fn backoff_hint(&self) -> Option<Duration> {
        match self {
            TradingError::Throttled(_) => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

// Conversion implementations for common error types

impl From<io::Error> for TradingError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
                TradingError::TransientNetwork(err.to_string())
            }
            _ => TradingError::PersistenceFailure(format!("IO error: {}", err)),
        }
    }
}

impl From<rusqlite::Error> for TradingError {
    fn from(err: rusqlite::Error) -> Self {
        TradingError::PersistenceFailure(format!("SQLite error: {}", err))
    }
}

impl From<refinery::Error> for TradingError {
    fn from(err: refinery::Error) -> Self {
        TradingError::PersistenceFailure(format!("Migration error: {}", err))
    }
}

impl From<serde_json::Error> for TradingError {
    fn from(err: serde_json::Error) -> Self {
        TradingError::Decode(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for TradingError {
    fn from(err: toml::de::Error) -> Self {
        TradingError::ConfigurationInvalid(format!("TOML parse error: {}", err))
    }
}

impl From<reqwest::Error> for TradingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            TradingError::TransientNetwork(err.to_string())
        } else if err.is_decode() {
            TradingError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() {
                TradingError::TransientNetwork(err.to_string())
            } else {
                TradingError::Rejected(err.to_string())
            }
        } else {
            TradingError::TransientNetwork(err.to_string())
        }
    }
}

impl From<rust_decimal::Error> for TradingError {
    fn from(err: rust_decimal::Error) -> Self {
        TradingError::Decode(format!("Decimal error: {}", err))
    }
}

impl From<crate::config::ConfigError> for TradingError {
    fn from(err: crate::config::ConfigError) -> Self {
        TradingError::ConfigurationInvalid(err.to_string())
    }
}

/// Result type alias using TradingError
pub type TradingResult<T> = Result<T, TradingError>;
