//! Configuration management for FxSentry
//!
//! Loads defaults + optional config files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub broker: BrokerConfig,
    pub risk: RiskConfig,
    pub exits: ExitConfig,
    pub persistence: PersistenceConfig,
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot version tag for logging
    pub tag: String,
    /// Currency pairs to monitor
    pub instruments: Vec<String>,
    /// Entry scan interval in seconds
    pub scan_interval_secs: u64,
    /// Exit evaluation interval in seconds
    pub exit_interval_secs: u64,
    /// Dry run mode (no real orders)
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// OANDA REST endpoint ("practice" or "live" selects the default host)
    pub environment: String,
    /// Explicit API base URL override; empty = derive from environment
    pub api_url: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
    /// Minimum interval between calls to the same endpoint class, in milliseconds
    pub min_call_interval_ms: u64,
}

impl BrokerConfig {
    /// Resolve the REST base URL from the override or the environment name.
    pub fn base_url(&self) -> &str {
        if !self.api_url.is_empty() {
            return &self.api_url;
        }
        match self.environment.as_str() {
            "live" => "https://api-fxtrade.oanda.com",
            _ => "https://api-fxpractice.oanda.com",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Percentage of account balance to risk per trade (1.0 = 1%)
    pub risk_pct: f64,
    /// Stop-loss distance used for position sizing, in pips
    pub stop_loss_pips: f64,
    /// Reject entries when the quoted spread exceeds this many pips
    pub max_spread_pips: f64,
    /// Maximum opens per instrument per UTC day
    pub max_trades_per_day: u32,
    /// Maximum concurrently open trades across all instruments
    pub max_global_trades: usize,
    /// Minimum seconds between successive opens on the same instrument
    pub cooldown_secs: i64,
    /// Seconds a signal hash stays in the duplicate-suppression set
    pub signal_ttl_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    /// Hard timeout: close any trade held longer than this, in seconds
    pub max_hold_secs: i64,
    /// Base profit target in pips, scaled by the volatility multiplier
    pub profit_target_pips: f64,
    /// Trailing stop distance in pips
    pub trailing_stop_pips: f64,
    /// Close when unrealized P&L drops below this (account currency, negative)
    pub min_loss_cutoff: f64,
    /// Samples kept per instrument for the momentum-reversal rule
    pub price_history_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Canonical state file
    pub state_file: String,
    /// Backup directory
    pub backup_dir: String,
    /// Minimum seconds between backups
    pub backup_interval_secs: i64,
    /// Backups retained; oldest trimmed first
    pub max_backups: usize,
    /// Directory for the CSV trade journal
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Sliding-window command rate limit
    pub max_commands_per_min: usize,
    /// Log file the diagnostics command tails
    pub log_file: String,
}

impl AppConfig {
    /// Load configuration from defaults, optional files and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Bot defaults
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default(
                "bot.instruments",
                vec!["EUR_USD", "GBP_USD", "USD_JPY", "AUD_USD", "USD_CHF"],
            )?
            .set_default("bot.scan_interval_secs", 60)?
            .set_default("bot.exit_interval_secs", 60)?
            .set_default("bot.dry_run", true)?
            // Broker defaults
            .set_default("broker.environment", "practice")?
            .set_default("broker.api_url", "")?
            .set_default("broker.timeout_ms", 10_000)?
            .set_default("broker.min_call_interval_ms", 500)?
            // Risk defaults
            .set_default("risk.risk_pct", 1.0)?
            .set_default("risk.stop_loss_pips", 20.0)?
            .set_default("risk.max_spread_pips", 2.0)?
            .set_default("risk.max_trades_per_day", 10)?
            .set_default("risk.max_global_trades", 50)?
            .set_default("risk.cooldown_secs", 6)?
            .set_default("risk.signal_ttl_secs", 300)?
            // Exit defaults
            .set_default("exits.max_hold_secs", 7_200)?
            .set_default("exits.profit_target_pips", 10.0)?
            .set_default("exits.trailing_stop_pips", 15.0)?
            .set_default("exits.min_loss_cutoff", -50.0)?
            .set_default("exits.price_history_len", 12)?
            // Persistence defaults
            .set_default("persistence.state_file", "trade_state.json")?
            .set_default("persistence.backup_dir", "state_backups")?
            .set_default("persistence.backup_interval_secs", 300)?
            .set_default("persistence.max_backups", 12)?
            .set_default("persistence.data_dir", "./data")?
            // Chat defaults
            .set_default("chat.max_commands_per_min", 10)?
            .set_default("chat.log_file", "logs/fxsentry.log")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (FXSENTRY_*)
            .add_source(Environment::with_prefix("FXSENTRY").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} instruments={:?} scan={}s dry_run={} env={}",
            self.bot.tag,
            self.bot.instruments,
            self.bot.scan_interval_secs,
            self.bot.dry_run,
            self.broker.environment
        )
    }

    /// Validate required environment variables.
    ///
    /// A missing broker identity is fatal: the process must refuse to start
    /// rather than trade against the wrong account.
    pub fn validate_env(&self) -> Result<()> {
        for var in ["OANDA_API_TOKEN", "OANDA_ACCOUNT_ID"] {
            match std::env::var(var) {
                Ok(v) if !v.trim().is_empty() => {}
                _ => bail!("Required environment variable {} is not set", var),
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
