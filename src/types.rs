//! Core types used throughout FxSentry
//!
//! Instruments, directions, signals and trade records shared by every module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Signed unit multiplier for broker orders (positive = long)
    pub fn sign(&self) -> i64 {
        match self {
            Direction::Long => 1,
            Direction::Short => -1,
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "long" | "buy" => Some(Direction::Long),
            "short" | "sell" => Some(Direction::Short),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Smallest standard price increment for a currency pair.
///
/// JPY-quoted pairs tick in hundredths; everything else in ten-thousandths.
pub fn pip_size(instrument: &str) -> f64 {
    if instrument.ends_with("_JPY") {
        0.01
    } else {
        0.0001
    }
}

/// Direction-aware price move expressed in pips.
pub fn profit_pips(instrument: &str, direction: Direction, entry: f64, current: f64) -> f64 {
    let diff = match direction {
        Direction::Long => current - entry,
        Direction::Short => entry - current,
    };
    diff / pip_size(instrument)
}

/// Trading signal produced by a signal source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Unique signal ID
    pub id: String,
    /// Timestamp (Unix seconds)
    pub ts: i64,
    /// Currency pair, e.g. "EUR_USD"
    pub instrument: String,
    /// Proposed direction
    pub direction: Direction,
    /// Confidence level (0.0 - 1.0)
    pub confidence: f64,
    /// Price observed when the signal was formed
    pub price: f64,
}

/// A live position known to this process.
///
/// Created when an order fill is confirmed; removed (not archived) on close,
/// with the outcome folded into per-instrument performance stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTrade {
    /// Broker-assigned trade ID
    pub trade_id: String,
    /// Currency pair
    pub instrument: String,
    /// Direction
    pub direction: Direction,
    /// Position size in units
    pub units: i64,
    /// Fill price at entry
    pub entry_price: f64,
    /// When the fill was confirmed
    pub open_time: DateTime<Utc>,
    /// ATR at entry, used by the exit engine's volatility-scaled target
    pub atr_at_entry: f64,
}

impl OpenTrade {
    /// Unrealized P&L in account currency at the given price.
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        let diff = match self.direction {
            Direction::Long => current_price - self.entry_price,
            Direction::Short => self.entry_price - current_price,
        };
        diff * self.units as f64
    }
}

/// Result classification for a closed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOutcome {
    Win,
    Loss,
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeOutcome::Win => write!(f, "WIN"),
            TradeOutcome::Loss => write!(f, "LOSS"),
        }
    }
}

/// A trade that has been closed out at the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub trade_id: String,
    pub instrument: String,
    pub direction: Direction,
    pub units: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub outcome: TradeOutcome,
    /// Why the exit engine (or a manual command) closed it, snake_case
    pub exit_reason: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pip_size_jpy_pairs() {
        assert_eq!(pip_size("USD_JPY"), 0.01);
        assert_eq!(pip_size("EUR_USD"), 0.0001);
        assert_eq!(pip_size("GBP_USD"), 0.0001);
    }

    #[test]
    fn direction_parses_broker_and_chat_forms() {
        assert_eq!(Direction::from_str("buy"), Some(Direction::Long));
        assert_eq!(Direction::from_str("SHORT"), Some(Direction::Short));
        assert_eq!(Direction::from_str("hold"), None);
        assert_eq!(Direction::Long.sign(), 1);
        assert_eq!(Direction::Short.sign(), -1);
    }

    #[test]
    fn profit_pips_direction_aware() {
        // 11 pips in favor of a long
        let p = profit_pips("EUR_USD", Direction::Long, 1.1000, 1.1011);
        assert!((p - 11.0).abs() < 1e-6);

        // Same move is 11 pips against a short
        let p = profit_pips("EUR_USD", Direction::Short, 1.1000, 1.1011);
        assert!((p + 11.0).abs() < 1e-6);
    }

    #[test]
    fn unrealized_pnl_scales_with_units() {
        let trade = OpenTrade {
            trade_id: "1".into(),
            instrument: "EUR_USD".into(),
            direction: Direction::Long,
            units: 10_000,
            entry_price: 1.1000,
            open_time: Utc::now(),
            atr_at_entry: 0.0008,
        };
        let pnl = trade.unrealized_pnl(1.1011);
        assert!((pnl - 11.0).abs() < 1e-6);
    }
}
