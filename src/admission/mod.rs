//! Admission control for trade entry
//!
//! Decides whether a new trade may be opened: global and per-instrument
//! daily caps, cooldown, one in-flight open attempt per instrument, and
//! duplicate-signal suppression.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::config::RiskConfig;
use crate::state::TradeState;
use crate::types::Signal;

/// Why an open attempt was turned away. Not an error: a normal decision
/// outcome, logged at info level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    GlobalCap,
    DailyCap,
    Cooldown,
    TradeInProgress,
    DuplicateSignal,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::GlobalCap => write!(f, "max global trades reached"),
            RejectReason::DailyCap => write!(f, "max trades for instrument today"),
            RejectReason::Cooldown => write!(f, "cooldown not passed"),
            RejectReason::TradeInProgress => write!(f, "trade in progress"),
            RejectReason::DuplicateSignal => write!(f, "duplicate signal"),
        }
    }
}

/// Outcome of an admission check. Never persisted; computed per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<RejectReason>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn reject(reason: RejectReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Scoped hold on an instrument's entry slot. Released on drop, on every
/// exit path.
pub struct InstrumentGuard {
    instrument: String,
    locks: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InstrumentGuard {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(&self.instrument);
        }
    }
}

/// Gates trade entry against current [`TradeState`].
pub struct AdmissionController {
    config: RiskConfig,
    /// Instruments with an open attempt currently in flight
    locks: Arc<Mutex<HashSet<String>>>,
}

impl AdmissionController {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            locks: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Pure function of current state; does not mutate. Checks short-circuit
    /// in order: global cap, per-instrument daily cap, cooldown.
    pub fn can_trade(&self, instrument: &str, state: &TradeState, now_ts: i64) -> AdmissionDecision {
        if state.open_trades.len() >= self.config.max_global_trades {
            return AdmissionDecision::reject(RejectReason::GlobalCap);
        }

        if state
            .daily_trade_count
            .get(instrument)
            .copied()
            .unwrap_or(0)
            >= self.config.max_trades_per_day
        {
            return AdmissionDecision::reject(RejectReason::DailyCap);
        }

        if let Some(&last) = state.last_trade_time.get(instrument) {
            if now_ts - last < self.config.cooldown_secs {
                return AdmissionDecision::reject(RejectReason::Cooldown);
            }
        }

        AdmissionDecision::allow()
    }

    /// Acquire the per-instrument entry slot. `None` means another open
    /// attempt is already in flight for this instrument.
    pub fn try_lock(&self, instrument: &str) -> Option<InstrumentGuard> {
        let mut locks = self.locks.lock().ok()?;
        if !locks.insert(instrument.to_string()) {
            return None;
        }
        Some(InstrumentGuard {
            instrument: instrument.to_string(),
            locks: Arc::clone(&self.locks),
        })
    }

    pub fn is_locked(&self, instrument: &str) -> bool {
        self.locks
            .lock()
            .map(|l| l.contains(instrument))
            .unwrap_or(false)
    }
}

/// Deterministic hash of a signal's salient fields: instrument, direction,
/// price rounded to one pip, and a 60-second time bucket.
pub fn signal_hash(signal: &Signal) -> String {
    let pip = crate::types::pip_size(&signal.instrument);
    let rounded_price = (signal.price / pip).round() as i64;
    let time_bucket = signal.ts / 60;

    let mut hasher = Sha256::new();
    hasher.update(signal.instrument.as_bytes());
    hasher.update([b'|']);
    hasher.update(signal.direction.to_string().as_bytes());
    hasher.update([b'|']);
    hasher.update(rounded_price.to_le_bytes());
    hasher.update(time_bucket.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, OpenTrade};
    use chrono::Utc;

    fn risk_config() -> RiskConfig {
        RiskConfig {
            risk_pct: 1.0,
            stop_loss_pips: 20.0,
            max_spread_pips: 2.0,
            max_trades_per_day: 10,
            max_global_trades: 50,
            cooldown_secs: 6,
            signal_ttl_secs: 300,
        }
    }

    fn open_trade(id: &str, instrument: &str) -> OpenTrade {
        OpenTrade {
            trade_id: id.to_string(),
            instrument: instrument.to_string(),
            direction: Direction::Long,
            units: 1_000,
            entry_price: 1.1,
            open_time: Utc::now(),
            atr_at_entry: 0.0008,
        }
    }

    fn sample_signal(instrument: &str, ts: i64, price: f64) -> Signal {
        Signal {
            id: "s1".into(),
            ts,
            instrument: instrument.into(),
            direction: Direction::Long,
            confidence: 0.8,
            price,
        }
    }

    #[test]
    fn cooldown_boundary_is_exact() {
        let ctl = AdmissionController::new(risk_config());
        let mut state = TradeState::default();
        state.last_trade_time.insert("EUR_USD".into(), 1_000);

        // 5 seconds elapsed: still cooling down
        let d = ctl.can_trade("EUR_USD", &state, 1_005);
        assert_eq!(d.reason, Some(RejectReason::Cooldown));

        // Exactly 6 seconds elapsed: allowed
        let d = ctl.can_trade("EUR_USD", &state, 1_006);
        assert!(d.allowed);
    }

    #[test]
    fn daily_cap_enforced_per_instrument() {
        let ctl = AdmissionController::new(risk_config());
        let mut state = TradeState::default();
        state.daily_trade_count.insert("EUR_USD".into(), 10);

        let d = ctl.can_trade("EUR_USD", &state, 1_000);
        assert_eq!(d.reason, Some(RejectReason::DailyCap));

        // Other instruments unaffected
        assert!(ctl.can_trade("GBP_USD", &state, 1_000).allowed);
    }

    #[test]
    fn global_cap_takes_precedence() {
        let ctl = AdmissionController::new(risk_config());
        let mut state = TradeState::default();
        for i in 0..50 {
            state.open_trades.push(open_trade(&i.to_string(), "EUR_USD"));
        }
        // Daily cap would also reject; global cap is checked first
        state.daily_trade_count.insert("EUR_USD".into(), 10);

        let d = ctl.can_trade("EUR_USD", &state, 1_000);
        assert_eq!(d.reason, Some(RejectReason::GlobalCap));
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let ctl = AdmissionController::new(risk_config());

        let guard = ctl.try_lock("EUR_USD").unwrap();
        assert!(ctl.try_lock("EUR_USD").is_none());
        // Other instruments are independent
        assert!(ctl.try_lock("GBP_USD").is_some());

        drop(guard);
        assert!(!ctl.is_locked("EUR_USD"));
        assert!(ctl.try_lock("EUR_USD").is_some());
    }

    #[test]
    fn lock_released_when_attempt_panics() {
        let ctl = Arc::new(AdmissionController::new(risk_config()));
        let ctl2 = Arc::clone(&ctl);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = ctl2.try_lock("EUR_USD").unwrap();
            panic!("order placement blew up");
        }));
        assert!(result.is_err());

        // Guard dropped during unwind; the slot must be free again
        assert!(ctl.try_lock("EUR_USD").is_some());
    }

    #[test]
    fn signal_hash_stable_within_bucket() {
        let a = signal_hash(&sample_signal("EUR_USD", 120, 1.10004));
        // Same minute bucket, price rounds to the same pip
        let b = signal_hash(&sample_signal("EUR_USD", 150, 1.10001));
        assert_eq!(a, b);

        // Next minute bucket differs
        let c = signal_hash(&sample_signal("EUR_USD", 180, 1.10004));
        assert_ne!(a, c);

        // One pip away differs
        let d = signal_hash(&sample_signal("EUR_USD", 120, 1.1002));
        assert_ne!(a, d);
    }
}
