//! Risk-percentage position sizing
//!
//! units = (balance × risk%) / (stop-loss distance in pips × pip value)

use anyhow::{bail, Result};

/// Sizes positions as a fixed fraction of account balance at risk.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    /// Percentage of account balance to risk per trade (1.0 = 1%)
    risk_pct: f64,
}

impl PositionSizer {
    pub fn new(risk_pct: f64) -> Self {
        Self { risk_pct }
    }

    /// Units to trade given the balance and the stop-loss distance.
    pub fn units(&self, balance: f64, stop_loss_pips: f64, pip_value: f64) -> Result<i64> {
        if stop_loss_pips <= 0.0 {
            bail!("Stop loss in pips must be greater than 0");
        }
        if balance <= 0.0 {
            bail!("Account balance must be positive");
        }
        let risk_amount = balance * (self.risk_pct / 100.0);
        let units = risk_amount / (stop_loss_pips * pip_value);
        Ok(units as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_from_risk_fraction() {
        let sizer = PositionSizer::new(1.0);
        // 1% of 10,000 = 100 at risk; 20 pips * 0.0001 = 0.002 per unit
        let units = sizer.units(10_000.0, 20.0, 0.0001).unwrap();
        assert_eq!(units, 50_000);
    }

    #[test]
    fn rejects_non_positive_stop() {
        let sizer = PositionSizer::new(1.0);
        assert!(sizer.units(10_000.0, 0.0, 0.0001).is_err());
        assert!(sizer.units(10_000.0, -5.0, 0.0001).is_err());
    }

    #[test]
    fn rejects_non_positive_balance() {
        let sizer = PositionSizer::new(1.0);
        assert!(sizer.units(0.0, 20.0, 0.0001).is_err());
    }
}
