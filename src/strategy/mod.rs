//! Strategy collaborator seams
//!
//! Signal generation and volatility estimation are external collaborators;
//! the lifecycle core only depends on these traits. Minimal default
//! implementations ship so the binary runs end to end.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::RwLock;
use tracing::debug;

use crate::broker::Broker;
use crate::types::{Direction, Signal};

/// Produces candidate trade signals for a set of instruments.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn signals(&self, instruments: &[String]) -> Vec<Signal>;
}

/// Supplies volatility estimates, derived from recent ATR by a real
/// implementation.
#[async_trait]
pub trait VolatilityModel: Send + Sync {
    /// Multiplier applied to the base profit target.
    async fn atr_multiplier(&self, instrument: &str) -> f64;

    /// Raw ATR value recorded on newly opened trades. Zero when the
    /// collaborator has no estimate.
    async fn atr(&self, instrument: &str) -> f64 {
        let _ = instrument;
        0.0
    }
}

/// Constant-multiplier volatility model.
pub struct FixedVolatility {
    multiplier: f64,
}

impl FixedVolatility {
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }
}

#[async_trait]
impl VolatilityModel for FixedVolatility {
    async fn atr_multiplier(&self, _instrument: &str) -> f64 {
        self.multiplier
    }
}

/// Naive three-sample momentum source over broker mid prices.
///
/// A stand-in for a real indicator stack: emits a signal in the direction of
/// three consecutive moves. Confidence is fixed and modest.
pub struct PriceMomentumSource {
    broker: Arc<dyn Broker>,
    history: RwLock<HashMap<String, VecDeque<f64>>>,
}

impl PriceMomentumSource {
    const SAMPLES: usize = 3;
    const CONFIDENCE: f64 = 0.6;

    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            history: RwLock::new(HashMap::new()),
        }
    }

    fn push_and_read(&self, instrument: &str, mid: f64) -> Vec<f64> {
        let mut history = self.history.write().unwrap();
        let prices = history.entry(instrument.to_string()).or_default();
        prices.push_back(mid);
        while prices.len() > Self::SAMPLES {
            prices.pop_front();
        }
        prices.iter().copied().collect()
    }

    fn direction_of(samples: &[f64]) -> Option<Direction> {
        if samples.len() < Self::SAMPLES {
            return None;
        }
        if samples.windows(2).all(|w| w[1] > w[0]) {
            Some(Direction::Long)
        } else if samples.windows(2).all(|w| w[1] < w[0]) {
            Some(Direction::Short)
        } else {
            None
        }
    }
}

#[async_trait]
impl SignalSource for PriceMomentumSource {
    async fn signals(&self, instruments: &[String]) -> Vec<Signal> {
        let mut out = Vec::new();
        for instrument in instruments {
            let quote = match self.broker.price(instrument).await {
                Ok(q) => q,
                Err(e) => {
                    debug!(instrument, error = %e, "Price fetch failed, skipping");
                    continue;
                }
            };
            let samples = self.push_and_read(instrument, quote.mid());
            if let Some(direction) = Self::direction_of(&samples) {
                out.push(Signal {
                    id: uuid::Uuid::new_v4().to_string(),
                    ts: Utc::now().timestamp(),
                    instrument: instrument.clone(),
                    direction,
                    confidence: Self::CONFIDENCE,
                    price: quote.mid(),
                });
            }
        }
        out
    }
}
