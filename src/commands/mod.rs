//! Chat-facing command surface
//!
//! Transport-agnostic: each command is a plain function returning a
//! human-readable result string on both success and failure paths. No
//! exception or stack trace ever reaches the chat layer; only the
//! diagnostics command surfaces recent log tail content.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::engine::TradeEngine;

/// Sliding-window rate limiter over a fixed one-minute window.
pub struct RateLimiter {
    max_per_min: usize,
    timestamps: Mutex<Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_per_min: usize) -> Self {
        Self {
            max_per_min,
            timestamps: Mutex::new(Vec::new()),
        }
    }

    /// True when the call should be dropped.
    pub fn limited(&self) -> bool {
        let now = Instant::now();
        let mut stamps = self.timestamps.lock().unwrap();
        stamps.retain(|t| now.duration_since(*t) < Duration::from_secs(60));
        if stamps.len() >= self.max_per_min {
            return true;
        }
        stamps.push(now);
        false
    }
}

/// Handles chat commands against the running engine.
pub struct CommandHandler {
    engine: Arc<TradeEngine>,
    limiter: RateLimiter,
    log_file: PathBuf,
}

const RATE_LIMIT_MSG: &str = "Rate limit reached, try again shortly.";

impl CommandHandler {
    pub fn new(engine: Arc<TradeEngine>) -> Self {
        let chat = &engine.config().chat;
        let limiter = RateLimiter::new(chat.max_commands_per_min);
        let log_file = PathBuf::from(&chat.log_file);
        Self {
            engine,
            limiter,
            log_file,
        }
    }

    /// System status: uptime and open-position overview.
    pub fn status(&self) -> String {
        if self.limiter.limited() {
            return RATE_LIMIT_MSG.to_string();
        }
        let uptime = Utc::now() - self.engine.started_at();
        let hours = uptime.num_hours();
        let minutes = uptime.num_minutes() % 60;
        let (open, today) = self
            .engine
            .store()
            .with(|s| (s.open_trades.len(), s.global_trade_count));
        format!(
            "System Status\n\
             - Uptime: {}h {}m\n\
             - Open trades: {}\n\
             - Trades today: {}\n\
             - Scan interval: {}s",
            hours,
            minutes,
            open,
            today,
            self.engine.config().bot.scan_interval_secs
        )
    }

    /// Aggregate P&L and win-rate report from persisted performance stats.
    pub fn report(&self) -> String {
        if self.limiter.limited() {
            return RATE_LIMIT_MSG.to_string();
        }
        self.engine.store().with(|s| {
            let wins = s.total_wins();
            let losses = s.total_losses();
            let total = wins + losses;
            let win_rate = if total > 0 {
                wins as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            format!(
                "Trade Report\n\
                 - Realized P&L: {:.2}\n\
                 - Win Rate: {:.2}% ({} wins / {} losses)\n\
                 - Trades Today: {}\n\
                 - Open Positions: {}",
                s.total_realized_pnl(),
                win_rate,
                wins,
                losses,
                s.global_trade_count,
                s.open_trades.len()
            )
        })
    }

    /// One manual admission-gated open attempt.
    pub async fn make_trade(&self) -> String {
        if self.limiter.limited() {
            return RATE_LIMIT_MSG.to_string();
        }
        self.engine.manual_trade().await
    }

    /// Close every open trade via the broker.
    pub async fn close_trades(&self) -> String {
        if self.limiter.limited() {
            return RATE_LIMIT_MSG.to_string();
        }
        self.engine.close_all().await
    }

    /// Last ten lines of the log file.
    pub async fn diagnostics(&self) -> String {
        if self.limiter.limited() {
            return RATE_LIMIT_MSG.to_string();
        }
        match tokio::fs::read_to_string(&self.log_file).await {
            Ok(content) => {
                let lines: Vec<&str> = content.lines().collect();
                let tail = lines.len().saturating_sub(10);
                if lines.is_empty() {
                    "No recent log output.".to_string()
                } else {
                    lines[tail..].join("\n")
                }
            }
            Err(_) => "Log file not found.".to_string(),
        }
    }
}
