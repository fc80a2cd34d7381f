// MEXC Grid Trading Bot - CLI
// Single entry point for all grid operations

use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn, Level};
use mexc_grid_bot::{Config, ConfigError};

// Load command modules from cli directory
#[path = "../cli/trade_commands.rs"]
mod trade_commands;

#[derive(Parser)]
#[command(name = "grid-bot")]
#[command(version = "0.3.0")]
#[command(about = "Grid trading bot for MEXC spot markets", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run pre-flight checks against the exchange
    Validate {
        /// Check against the paper exchange instead of MEXC
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Trade until Ctrl-C
    Run {
        /// Paper trading on a simulated market
        #[arg(short, long)]
        dry_run: bool,

        /// Cancel the grid's open orders before exiting
        #[arg(long)]
        cancel_on_exit: bool,

        /// Lift a latched drawdown kill switch before trading
        #[arg(long)]
        reset_kill_switch: bool,
    },

    /// Show the persisted ledger of the configured session
    Status {
        /// List every non-empty level
        #[arg(short, long)]
        detailed: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logging comes up before the config is validated so config errors are visible
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        configured_level(&cli.config)
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("🚀 MEXC Grid Bot v0.3.0");
    info!("📁 Config: {}", cli.config);

    match cli.command {
        // Init doesn't require config (it creates it)
        Commands::Init { force } => {
            init_config(&cli.config, force)?;
        }

        Commands::Validate { dry_run } => {
            let config = load_config_or_exit(&cli.config);
            if !trade_commands::validate(config, dry_run).await? {
                std::process::exit(1);
            }
        }

        Commands::Run {
            dry_run,
            cancel_on_exit,
            reset_kill_switch,
        } => {
            let config = load_config_or_exit(&cli.config);
            if let Err(e) = trade_commands::run_grid(config, dry_run, cancel_on_exit, reset_kill_switch).await {
                error!("❌ {}", e.user_message());
                std::process::exit(1);
            }
        }

        Commands::Status { detailed } => {
            let config = load_config_or_exit(&cli.config);
            trade_commands::show_status(config, detailed).await?;
        }
    }

    Ok(())
}

/// Level from `[logging].level`, falling back to info
fn configured_level(path: &str) -> Level {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .and_then(|config| Level::from_str(&config.logging.level).ok())
        .unwrap_or(Level::INFO)
}

/// Load config or exit with helpful error message
fn load_config_or_exit(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Configuration Error");
            error!("{}", e);

            if matches!(e, ConfigError::FileRead(_)) {
                error!("");
                error!("💡 Quick fix:");
                error!("   1. Run: grid-bot init");
                error!("   2. Edit config.toml with your grid bounds and API keys");
                error!("   3. Try again");
            }

            std::process::exit(1);
        }
    }
}

fn init_config(path: &str, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("🔧 Initializing configuration...");

    if std::path::Path::new(path).exists() && !force {
        warn!("⚠️  {} already exists, skipping (use --force to overwrite)", path);
        return Ok(());
    }

    let config = Config::default();
    if let Some(parent) = std::path::Path::new(&config.persistence.path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    config.to_file(path)?;
    info!("📝 Created {}", path);

    info!("✅ Configuration initialized!");
    info!("💡 Next steps:");
    info!("   1. Edit {} with your grid bounds and API keys", path);
    info!("   2. Run: grid-bot validate --dry-run");
    info!("   3. Run: grid-bot run --dry-run");

    Ok(())
}
