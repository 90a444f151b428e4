//! Instrument and session selection
//!
//! Filters the configured pair list by trading-session activity. The major
//! sessions overlap enough that most of the day is active; the late-NY lull
//! (21:00-23:00 UTC) is treated as low liquidity and skipped.

use chrono::{DateTime, Timelike, Utc};

/// Hours (UTC) treated as too thin to trade
const LOW_LIQUIDITY_START: u32 = 21;
const LOW_LIQUIDITY_END: u32 = 23;

/// True during the London, New York or Tokyo session windows.
pub fn is_active_session(now: DateTime<Utc>) -> bool {
    let hour = now.hour();
    (7..16).contains(&hour) || (13..22).contains(&hour) || hour < 9
}

/// True during the late-NY low-liquidity window.
pub fn is_low_liquidity(now: DateTime<Utc>) -> bool {
    let hour = now.hour();
    (LOW_LIQUIDITY_START..=LOW_LIQUIDITY_END).contains(&hour)
}

/// The configured instruments, or nothing when the session is inactive or
/// liquidity is thin.
pub fn select_instruments(configured: &[String], now: DateTime<Utc>) -> Vec<String> {
    if !is_active_session(now) || is_low_liquidity(now) {
        return Vec::new();
    }
    configured.to_vec()
}
