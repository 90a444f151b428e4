//! Trade lifecycle orchestrator
//!
//! Drives two independent periodic loops over the same [`StateStore`]: an
//! entry loop (instrument selection, signal gating, order placement) and an
//! exit loop (rule evaluation and closes). A UTC daily reset zeroes the
//! counters as a single state mutation. Failures inside one instrument's
//! entry or exit evaluation are isolated; they never abort the scan for the
//! rest.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::admission::{signal_hash, AdmissionController};
use crate::broker::{AccountSummary, Broker};
use crate::config::AppConfig;
use crate::exits::{ExitReason, ExitStrategyEngine};
use crate::journal::{JournalRecord, TradeJournal};
use crate::select::select_instruments;
use crate::sizing::PositionSizer;
use crate::state::StateStore;
use crate::strategy::{SignalSource, VolatilityModel};
use crate::types::{pip_size, ClosedTrade, OpenTrade, Signal, TradeOutcome};

pub struct TradeEngine {
    config: AppConfig,
    store: Arc<StateStore>,
    admission: AdmissionController,
    exits: ExitStrategyEngine,
    broker: Arc<dyn Broker>,
    signal_source: Arc<dyn SignalSource>,
    volatility: Arc<dyn VolatilityModel>,
    sizer: PositionSizer,
    journal: Option<Arc<TradeJournal>>,
    started_at: DateTime<Utc>,
}

impl TradeEngine {
    pub fn new(
        config: AppConfig,
        store: Arc<StateStore>,
        broker: Arc<dyn Broker>,
        signal_source: Arc<dyn SignalSource>,
        volatility: Arc<dyn VolatilityModel>,
    ) -> Self {
        let admission = AdmissionController::new(config.risk.clone());
        let exits = ExitStrategyEngine::new(config.exits.clone());
        let sizer = PositionSizer::new(config.risk.risk_pct);
        Self {
            config,
            store,
            admission,
            exits,
            broker,
            signal_source,
            volatility,
            sizer,
            journal: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_journal(mut self, journal: Arc<TradeJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run both loops until the shutdown signal flips, then flush the last
    /// scheduled state save.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut entry_tick =
            tokio::time::interval(Duration::from_secs(self.config.bot.scan_interval_secs));
        let mut exit_tick =
            tokio::time::interval(Duration::from_secs(self.config.bot.exit_interval_secs));
        entry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        exit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.reconcile().await;

        info!(
            scan = self.config.bot.scan_interval_secs,
            exit = self.config.bot.exit_interval_secs,
            "Trade engine started"
        );

        loop {
            tokio::select! {
                _ = entry_tick.tick() => self.entry_cycle().await,
                _ = exit_tick.tick() => self.exit_cycle().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Trade engine stopping, flushing state");
        self.store.save();
        self.store.flush().await;
    }

    /// Compare persisted open trades with what the broker reports.
    /// Discrepancies are logged for the operator, never auto-corrected:
    /// the store stays authoritative for what this process manages.
    pub async fn reconcile(&self) {
        let broker_trades = match self.broker.open_trades().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Reconciliation skipped, broker unavailable");
                return;
            }
        };
        self.store.with(|state| {
            for trade in &state.open_trades {
                if !broker_trades.iter().any(|t| t.trade_id == trade.trade_id) {
                    warn!(
                        trade_id = %trade.trade_id,
                        instrument = %trade.instrument,
                        "Persisted trade unknown to broker"
                    );
                }
            }
            for broker_trade in &broker_trades {
                if state.find_open(&broker_trade.trade_id).is_none() {
                    warn!(
                        trade_id = %broker_trade.trade_id,
                        instrument = %broker_trade.instrument,
                        "Broker reports a trade this process is not tracking"
                    );
                }
            }
        });
    }

    // ── entry side ───────────────────────────────────────────────

    /// One entry scan: daily reset, session gate, signal gathering, and one
    /// gated open attempt per signal.
    pub async fn entry_cycle(&self) {
        self.maybe_daily_reset();

        let now = Utc::now();
        let instruments = select_instruments(&self.config.bot.instruments, now);
        if instruments.is_empty() {
            debug!("Session inactive, skipping entry scan");
            return;
        }

        let account = match self.broker.account_summary().await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "Account summary unavailable, skipping entry scan");
                return;
            }
        };

        let signals = self.signal_source.signals(&instruments).await;
        for signal in &signals {
            match self.try_open(signal, &account).await {
                Ok(outcome) => info!(instrument = %signal.instrument, "{}", outcome),
                Err(e) => {
                    warn!(instrument = %signal.instrument, error = %e, "Entry attempt failed")
                }
            }
        }
    }

    /// One admission-gated open attempt. Returns a human-readable outcome on
    /// both success and rejection; errors are real order-path failures.
    pub async fn try_open(&self, signal: &Signal, account: &AccountSummary) -> Result<String> {
        let instrument = &signal.instrument;

        let quote = self
            .broker
            .price(instrument)
            .await
            .context("price fetch failed")?;
        let spread = quote.spread_pips();
        if spread > self.config.risk.max_spread_pips {
            return Ok(format!(
                "Spread too high on {} ({:.2} pips)",
                instrument, spread
            ));
        }

        let now_ts = Utc::now().timestamp();
        let decision = self
            .store
            .with(|state| self.admission.can_trade(instrument, state, now_ts));
        if !decision.allowed {
            let reason = decision.reason.map(|r| r.to_string()).unwrap_or_default();
            info!(instrument = %instrument, reason = %reason, "Admission rejected");
            return Ok(format!("Rejected {}: {}", instrument, reason));
        }

        let hash = signal_hash(signal);
        let duplicate = self
            .store
            .with(|s| s.has_recent_signal(&hash, now_ts, self.config.risk.signal_ttl_secs));
        if duplicate {
            return Ok(format!("Duplicate signal skipped for {}", instrument));
        }

        // One in-flight open attempt per instrument. The guard is scoped:
        // released on every exit path below, including errors.
        let _guard = match self.admission.try_lock(instrument) {
            Some(g) => g,
            None => return Ok(format!("Trade already in progress for {}", instrument)),
        };

        let units = self.sizer.units(
            account.balance,
            self.config.risk.stop_loss_pips,
            pip_size(instrument),
        )?;
        let signed_units = units * signal.direction.sign();

        if self.config.bot.dry_run {
            return Ok(format!(
                "Dry run: would open {} {} x{}",
                instrument, signal.direction, units
            ));
        }

        // Order-placement failure: no state mutation, no retry this cycle.
        let fill = self
            .broker
            .place_order(instrument, signed_units, None, None)
            .await
            .context("order placement failed")?;

        let atr = self.volatility.atr(instrument).await;
        let trade = OpenTrade {
            trade_id: fill.trade_id.clone(),
            instrument: instrument.clone(),
            direction: signal.direction,
            units,
            entry_price: fill.price,
            open_time: Utc::now(),
            atr_at_entry: atr,
        };
        self.store.with_mut(|state| {
            state.record_open(trade, now_ts);
            state.remember_signal(hash, now_ts, self.config.risk.signal_ttl_secs);
        });
        self.store.save();

        info!(
            instrument = %instrument,
            direction = %signal.direction,
            units,
            trade_id = %fill.trade_id,
            price = fill.price,
            "Trade opened"
        );
        Ok(format!(
            "Trade executed: {} {} x{}",
            instrument, signal.direction, units
        ))
    }

    /// Zero the daily counters when the UTC date key changes. Applied as one
    /// state mutation under the same write discipline as any other change.
    fn maybe_daily_reset(&self) {
        let date_key = Utc::now().format("%Y-%m-%d").to_string();
        let reset = self.store.with_mut(|state| {
            if state.counters_date == date_key {
                return false;
            }
            let rollover = !state.counters_date.is_empty();
            state.reset_daily(date_key);
            rollover
        });
        if reset {
            info!("Daily counters reset");
            self.store.save();
        }
    }

    // ── exit side ────────────────────────────────────────────────

    /// One exit poll over all open trades; per-trade failures are isolated.
    ///
    /// The broker's open-trade list is fetched first: a trade closed
    /// server-side (manual close, server-side stop) is dropped from local
    /// state instead of being re-evaluated forever. If the fetch fails, the
    /// cycle falls back to the local view rather than skipping exits.
    pub async fn exit_cycle(&self) {
        let open_trades = self.store.with(|s| s.open_trades.clone());
        if open_trades.is_empty() {
            return;
        }

        let broker_view = match self.broker.open_trades().await {
            Ok(trades) => Some(trades),
            Err(e) => {
                warn!(error = %e, "Broker open-trade fetch failed, using local view");
                None
            }
        };

        for trade in &open_trades {
            if let Some(view) = &broker_view {
                if !view.iter().any(|t| t.trade_id == trade.trade_id) {
                    warn!(
                        trade_id = %trade.trade_id,
                        instrument = %trade.instrument,
                        "Trade no longer open at the broker, dropping local record"
                    );
                    self.store
                        .with_mut(|s| s.open_trades.retain(|t| t.trade_id != trade.trade_id));
                    self.exits.forget_trade(&trade.trade_id);
                    self.store.save();
                    continue;
                }
            }
            if let Err(e) = self.evaluate_exit(trade).await {
                warn!(
                    trade_id = %trade.trade_id,
                    instrument = %trade.instrument,
                    error = %e,
                    "Exit evaluation failed"
                );
            }
        }
    }

    async fn evaluate_exit(&self, trade: &OpenTrade) -> Result<()> {
        let quote = self
            .broker
            .price(&trade.instrument)
            .await
            .context("price fetch failed")?;
        let multiplier = self.volatility.atr_multiplier(&trade.instrument).await;

        if let Some(reason) = self
            .exits
            .evaluate(trade, quote.mid(), multiplier, Utc::now())
        {
            self.close_trade(trade, reason).await?;
        }
        Ok(())
    }

    /// Close at the broker, fold the outcome into performance, journal it,
    /// and schedule a save.
    pub async fn close_trade(&self, trade: &OpenTrade, reason: ExitReason) -> Result<ClosedTrade> {
        let result = self
            .broker
            .close_trade(&trade.trade_id)
            .await
            .context("broker close failed")?;

        let outcome = if result.realized_pnl > 0.0 {
            TradeOutcome::Win
        } else {
            TradeOutcome::Loss
        };
        let closed = ClosedTrade {
            trade_id: trade.trade_id.clone(),
            instrument: trade.instrument.clone(),
            direction: trade.direction,
            units: trade.units,
            entry_price: trade.entry_price,
            exit_price: result.price,
            realized_pnl: result.realized_pnl,
            outcome,
            exit_reason: reason.to_string(),
            opened_at: trade.open_time,
            closed_at: Utc::now(),
        };

        self.store.with_mut(|state| state.record_close(&closed));
        self.exits.forget_trade(&trade.trade_id);
        self.store.save();

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&JournalRecord::from_closed(&closed)).await {
                warn!(error = %e, "Journal append failed");
            }
        }

        info!(
            trade_id = %closed.trade_id,
            instrument = %closed.instrument,
            reason = %reason,
            pnl = closed.realized_pnl,
            outcome = %closed.outcome,
            "Trade closed"
        );
        Ok(closed)
    }

    // ── chat-facing operations ───────────────────────────────────

    /// One manual admission-gated open attempt on the strongest current
    /// signal.
    pub async fn manual_trade(&self) -> String {
        let account = match self.broker.account_summary().await {
            Ok(a) => a,
            Err(e) => return format!("Account unavailable: {}", e),
        };
        let signals = self
            .signal_source
            .signals(&self.config.bot.instruments)
            .await;
        let best = signals
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        let Some(signal) = best else {
            return "No signal available right now.".to_string();
        };
        match self.try_open(&signal, &account).await {
            Ok(outcome) => outcome,
            Err(e) => format!("Trade error: {}", e),
        }
    }

    /// Close every open trade, reporting each result.
    pub async fn close_all(&self) -> String {
        let open_trades = self.store.with(|s| s.open_trades.clone());
        if open_trades.is_empty() {
            return "No open positions to close.".to_string();
        }

        let mut results = Vec::new();
        for trade in &open_trades {
            match self.close_trade(trade, ExitReason::Manual).await {
                Ok(closed) => results.push(format!(
                    "Closed {} {} - {} units: {:.2}",
                    closed.direction, closed.instrument, closed.units, closed.realized_pnl
                )),
                Err(e) => results.push(format!(
                    "Failed to close {} on {}: {}",
                    trade.trade_id, trade.instrument, e
                )),
            }
        }
        results.join("\n")
    }
}
