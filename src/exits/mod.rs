//! Exit strategy engine
//!
//! Evaluates an ordered set of independent exit rules over every open trade
//! each polling cycle. The first rule that fires closes the trade; later
//! rules are not checked that cycle. Evaluation order:
//!
//! 1. hard timeout (safety bound, overrides everything)
//! 2. dynamic profit target (volatility-scaled)
//! 3. trailing stop
//! 4. momentum reversal
//! 5. loss cutoff

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::RwLock;

use crate::config::ExitConfig;
use crate::types::{profit_pips, Direction, OpenTrade};

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    HardTimeout,
    ProfitTarget,
    TrailingStop,
    MomentumReversal,
    LossCutoff,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::HardTimeout => write!(f, "hard_timeout"),
            ExitReason::ProfitTarget => write!(f, "profit_target"),
            ExitReason::TrailingStop => write!(f, "trailing_stop"),
            ExitReason::MomentumReversal => write!(f, "momentum_reversal"),
            ExitReason::LossCutoff => write!(f, "loss_cutoff"),
            ExitReason::Manual => write!(f, "manual"),
        }
    }
}

/// Layered rule evaluation over open trades.
///
/// Keeps two side tables that are deliberately not part of the persisted
/// state: a bounded price history per instrument (momentum rule) and the
/// peak favorable excursion per trade (trailing stop).
pub struct ExitStrategyEngine {
    config: ExitConfig,
    price_history: RwLock<HashMap<String, VecDeque<f64>>>,
    peak_pips: RwLock<HashMap<String, f64>>,
}

impl ExitStrategyEngine {
    pub fn new(config: ExitConfig) -> Self {
        Self {
            config,
            price_history: RwLock::new(HashMap::new()),
            peak_pips: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate all rules for one trade at the given price. Returns the first
    /// rule that fires, or records the price into the momentum history and
    /// leaves the trade open.
    pub fn evaluate(
        &self,
        trade: &OpenTrade,
        current_price: f64,
        vol_multiplier: f64,
        now: DateTime<Utc>,
    ) -> Option<ExitReason> {
        // 1. Hard timeout, regardless of profit or loss.
        let held_secs = (now - trade.open_time).num_seconds();
        if held_secs > self.config.max_hold_secs {
            return Some(ExitReason::HardTimeout);
        }

        let pips = profit_pips(
            &trade.instrument,
            trade.direction,
            trade.entry_price,
            current_price,
        );
        let pnl = trade.unrealized_pnl(current_price);

        // 2. Dynamic profit target.
        let target = self.config.profit_target_pips * vol_multiplier;
        if pips >= target && pnl > 0.0 {
            return Some(ExitReason::ProfitTarget);
        }

        // 3. Trailing stop: armed after half the stop distance in favor;
        // fires once the stop level (peak minus stop distance) crosses entry.
        let peak = {
            let mut peaks = self.peak_pips.write().unwrap();
            let entry = peaks.entry(trade.trade_id.clone()).or_insert(pips);
            if pips > *entry {
                *entry = pips;
            }
            *entry
        };
        let armed = peak >= self.config.trailing_stop_pips / 2.0;
        if armed && peak - self.config.trailing_stop_pips >= 0.0 {
            return Some(ExitReason::TrailingStop);
        }

        // 4. Momentum reversal over the last 3 recorded prices.
        if self.momentum_against(trade) {
            return Some(ExitReason::MomentumReversal);
        }

        // 5. Loss cutoff.
        if pnl < self.config.min_loss_cutoff {
            return Some(ExitReason::LossCutoff);
        }

        self.record_price(&trade.instrument, current_price);
        None
    }

    /// Strictly adverse price sequence across the last three samples.
    /// Never fires with fewer than three.
    fn momentum_against(&self, trade: &OpenTrade) -> bool {
        let history = self.price_history.read().unwrap();
        let Some(prices) = history.get(&trade.instrument) else {
            return false;
        };
        if prices.len() < 3 {
            return false;
        }
        let last3: Vec<f64> = prices.iter().rev().take(3).rev().copied().collect();
        match trade.direction {
            Direction::Long => last3[0] > last3[1] && last3[1] > last3[2],
            Direction::Short => last3[0] < last3[1] && last3[1] < last3[2],
        }
    }

    /// Append to the bounded per-instrument history.
    pub fn record_price(&self, instrument: &str, price: f64) {
        let mut history = self.price_history.write().unwrap();
        let prices = history.entry(instrument.to_string()).or_default();
        prices.push_back(price);
        while prices.len() > self.config.price_history_len {
            prices.pop_front();
        }
    }

    /// Drop per-trade tracking once a trade is closed.
    pub fn forget_trade(&self, trade_id: &str) {
        self.peak_pips.write().unwrap().remove(trade_id);
    }
}
