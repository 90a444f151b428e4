//! Durable trade state store
//!
//! Single-writer, crash-safe persistence of all mutable trading memory:
//! cooldown timestamps, the open-trade registry, daily/global counters,
//! duplicate-signal hashes and per-instrument performance stats.
//!
//! Write protocol: serialize the full state to a temporary file in the same
//! directory, then atomically rename it over the canonical file. A reader
//! never observes a partial write; the rename is the only visible transition.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::types::{ClosedTrade, OpenTrade, TradeOutcome};

/// Win/loss record and smoothed confidence per instrument
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentStats {
    pub wins: u32,
    pub losses: u32,
    /// Smoothed win rate, 0.0 - 1.0
    pub confidence: f64,
    pub realized_pnl: f64,
}

/// Signal hash held for duplicate suppression, pruned by TTL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentSignal {
    pub hash: String,
    pub ts: i64,
}

/// The single persisted aggregate: the sole unit of atomic save/load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeState {
    /// Last successful open time per instrument (Unix seconds); governs cooldown
    #[serde(default)]
    pub last_trade_time: HashMap<String, i64>,
    /// Currently live positions known to this process
    #[serde(default)]
    pub open_trades: Vec<OpenTrade>,
    /// Opens per instrument today; reset at the UTC day boundary
    #[serde(default)]
    pub daily_trade_count: HashMap<String, u32>,
    /// Total opens today across instruments
    #[serde(default)]
    pub global_trade_count: u32,
    /// Bounded-lifetime set for duplicate suppression
    #[serde(default)]
    pub recent_signals: Vec<RecentSignal>,
    /// Aggregate outcomes per instrument
    #[serde(default)]
    pub performance: HashMap<String, InstrumentStats>,
    /// UTC date key ("YYYY-MM-DD") the daily counters belong to
    #[serde(default)]
    pub counters_date: String,
}

impl TradeState {
    /// Register a confirmed fill: open-trade record, counters, cooldown clock.
    pub fn record_open(&mut self, trade: OpenTrade, now_ts: i64) {
        self.last_trade_time
            .insert(trade.instrument.clone(), now_ts);
        *self
            .daily_trade_count
            .entry(trade.instrument.clone())
            .or_insert(0) += 1;
        self.global_trade_count += 1;
        self.open_trades.push(trade);
    }

    /// Remove a closed trade and fold its outcome into performance stats.
    pub fn record_close(&mut self, closed: &ClosedTrade) {
        self.open_trades.retain(|t| t.trade_id != closed.trade_id);
        let stats = self
            .performance
            .entry(closed.instrument.clone())
            .or_default();
        match closed.outcome {
            TradeOutcome::Win => stats.wins += 1,
            TradeOutcome::Loss => stats.losses += 1,
        }
        stats.realized_pnl += closed.realized_pnl;
        let total = stats.wins + stats.losses;
        if total > 0 {
            stats.confidence = stats.wins as f64 / total as f64;
        }
    }

    pub fn find_open(&self, trade_id: &str) -> Option<&OpenTrade> {
        self.open_trades.iter().find(|t| t.trade_id == trade_id)
    }

    /// Zero daily counters at the UTC day boundary.
    pub fn reset_daily(&mut self, date_key: String) {
        self.daily_trade_count.clear();
        self.global_trade_count = 0;
        self.counters_date = date_key;
    }

    /// True if this hash was seen within the TTL window.
    pub fn has_recent_signal(&self, hash: &str, now_ts: i64, ttl_secs: i64) -> bool {
        self.recent_signals
            .iter()
            .any(|s| s.hash == hash && now_ts - s.ts < ttl_secs)
    }

    /// Remember a signal hash, pruning expired entries in the same pass.
    pub fn remember_signal(&mut self, hash: String, now_ts: i64, ttl_secs: i64) {
        self.recent_signals.retain(|s| now_ts - s.ts < ttl_secs);
        self.recent_signals.push(RecentSignal { hash, ts: now_ts });
    }

    pub fn total_realized_pnl(&self) -> f64 {
        self.performance.values().map(|s| s.realized_pnl).sum()
    }

    pub fn total_wins(&self) -> u32 {
        self.performance.values().map(|s| s.wins).sum()
    }

    pub fn total_losses(&self) -> u32 {
        self.performance.values().map(|s| s.losses).sum()
    }
}

/// Filesystem layout for the store
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub state_file: PathBuf,
    pub backup_dir: PathBuf,
}

/// Crash-safe key/value persistence of [`TradeState`].
pub struct StateStore {
    state: RwLock<TradeState>,
    paths: StatePaths,
    /// Single global writer: concurrent saves queue behind each other
    write_lock: Arc<AsyncMutex<()>>,
    /// Unix seconds of the last backup copy
    last_backup: Arc<Mutex<i64>>,
    /// Last scheduled write, awaited by flush() at shutdown
    pending_save: Mutex<Option<JoinHandle<()>>>,
    /// Sequence assigned to each snapshot at save() time
    save_seq: AtomicU64,
    /// Highest sequence that has reached disk
    persisted_seq: Arc<AtomicU64>,
    backup_interval_secs: i64,
    max_backups: usize,
}

impl StateStore {
    /// Open the store, running the startup integrity check synchronously
    /// before any other component may read state.
    pub fn open(
        state_file: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        backup_interval_secs: i64,
        max_backups: usize,
    ) -> Result<Self> {
        let paths = StatePaths {
            state_file: state_file.into(),
            backup_dir: backup_dir.into(),
        };
        std::fs::create_dir_all(&paths.backup_dir).with_context(|| {
            format!("Failed to create backup dir {}", paths.backup_dir.display())
        })?;

        let state = Self::integrity_check(&paths.state_file)?;
        info!(
            path = %paths.state_file.display(),
            open_trades = state.open_trades.len(),
            "State store opened"
        );

        Ok(Self {
            state: RwLock::new(state),
            paths,
            write_lock: Arc::new(AsyncMutex::new(())),
            last_backup: Arc::new(Mutex::new(0)),
            pending_save: Mutex::new(None),
            save_seq: AtomicU64::new(0),
            persisted_seq: Arc::new(AtomicU64::new(0)),
            backup_interval_secs,
            max_backups,
        })
    }

    /// Absent file: write an empty valid state. Unparsable file: quarantine
    /// it under a timestamped name (never delete evidence) and reinitialize.
    fn integrity_check(state_file: &Path) -> Result<TradeState> {
        if !state_file.exists() {
            let empty = TradeState::default();
            Self::write_sync(state_file, &empty)?;
            return Ok(empty);
        }

        let raw = std::fs::read_to_string(state_file)
            .with_context(|| format!("Failed to read {}", state_file.display()))?;
        match serde_json::from_str::<TradeState>(&raw) {
            Ok(state) => Ok(state),
            Err(e) => {
                let timestamp = Utc::now().format("%Y%m%dT%H%M%S");
                let quarantine = state_file
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join(format!("corrupted_{}.json", timestamp));
                warn!(
                    error = %e,
                    quarantine = %quarantine.display(),
                    "State file unparsable, quarantining and reinitializing"
                );
                std::fs::copy(state_file, &quarantine)
                    .with_context(|| format!("Failed to quarantine {}", state_file.display()))?;
                let empty = TradeState::default();
                Self::write_sync(state_file, &empty)?;
                Ok(empty)
            }
        }
    }

    fn write_sync(state_file: &Path, state: &TradeState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(state_file, json)
            .with_context(|| format!("Failed to write {}", state_file.display()))?;
        Ok(())
    }

    /// Read access to the state under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&TradeState) -> R) -> R {
        let guard = self.state.read().unwrap();
        f(&guard)
    }

    /// Mutate the state under the lock. All mutation funnels through here so
    /// the admission invariants stay enforceable.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut TradeState) -> R) -> R {
        let mut guard = self.state.write().unwrap();
        f(&mut guard)
    }

    /// Clone the current state (for reports and restart tests).
    pub fn snapshot(&self) -> TradeState {
        self.state.read().unwrap().clone()
    }

    /// Schedule a durable write without blocking the caller.
    ///
    /// The snapshot is taken now, tagged with a monotonically increasing
    /// sequence; the write itself runs on a spawned task that queues behind
    /// any in-flight write. A task that reaches the lock after a newer
    /// snapshot has already been persisted skips its write, so saves never
    /// regress the file to an older state regardless of scheduling order.
    /// The handle is retained so shutdown can await the last scheduled save
    /// instead of losing it silently.
    pub fn save(&self) {
        let snapshot = self.snapshot();
        let seq = self.save_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let persisted = Arc::clone(&self.persisted_seq);
        let paths = self.paths.clone();
        let write_lock = Arc::clone(&self.write_lock);
        let last_backup = Arc::clone(&self.last_backup);
        let backup_interval = self.backup_interval_secs;
        let max_backups = self.max_backups;

        let handle = tokio::spawn(async move {
            let _writer = write_lock.lock().await;
            if persisted.load(Ordering::Acquire) >= seq {
                return;
            }
            if let Err(e) = write_snapshot(&snapshot, &paths).await {
                // Persistence failures never crash the trading loop; the
                // in-memory state stays authoritative until the next save.
                warn!(error = %e, "State save failed");
                return;
            }
            persisted.store(seq, Ordering::Release);
            maybe_backup(&paths, &last_backup, backup_interval, max_backups).await;
        });

        let mut pending = self.pending_save.lock().unwrap();
        *pending = Some(handle);
    }

    /// Await the last scheduled save. Called at shutdown.
    pub async fn flush(&self) {
        let handle = self.pending_save.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pending state save did not complete");
            }
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.paths.state_file
    }
}

/// Temp-file-then-atomic-rename write of the full state document.
async fn write_snapshot(state: &TradeState, paths: &StatePaths) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    let tmp_path = paths.state_file.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, &paths.state_file)
        .await
        .with_context(|| format!("Failed to rename over {}", paths.state_file.display()))?;
    Ok(())
}

/// Copy the canonical file into the backup directory if the interval has
/// elapsed, then trim to the newest `max_backups` entries.
async fn maybe_backup(
    paths: &StatePaths,
    last_backup: &Mutex<i64>,
    interval_secs: i64,
    max_backups: usize,
) {
    let now = Utc::now().timestamp();
    {
        let mut last = last_backup.lock().unwrap();
        if now - *last <= interval_secs {
            return;
        }
        *last = now;
    }

    let timestamp = Utc::now().format("%Y%m%dT%H%M%S");
    let backup_file = paths.backup_dir.join(format!("state_{}.json", timestamp));
    if let Err(e) = tokio::fs::copy(&paths.state_file, &backup_file).await {
        warn!(error = %e, path = %backup_file.display(), "State backup failed");
        return;
    }
    if let Err(e) = trim_backups(&paths.backup_dir, max_backups).await {
        warn!(error = %e, "Backup trim failed");
    }
}

/// Oldest-first eviction by filename sort order; backup names are
/// timestamp-ordered by construction.
async fn trim_backups(backup_dir: &Path, max_backups: usize) -> Result<()> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(backup_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name());
    }
    names.sort();
    while names.len() > max_backups {
        let oldest = names.remove(0);
        if let Err(e) = tokio::fs::remove_file(backup_dir.join(&oldest)).await {
            warn!(error = %e, file = ?oldest, "Failed to remove old backup");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use std::fs;

    fn temp_store_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fxsentry_{}_{}", tag, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn open_store(dir: &Path) -> StateStore {
        StateStore::open(
            dir.join("trade_state.json"),
            dir.join("state_backups"),
            300,
            12,
        )
        .unwrap()
    }

    fn sample_trade(id: &str, instrument: &str) -> OpenTrade {
        OpenTrade {
            trade_id: id.to_string(),
            instrument: instrument.to_string(),
            direction: Direction::Long,
            units: 10_000,
            entry_price: 1.1000,
            open_time: Utc::now(),
            atr_at_entry: 0.0008,
        }
    }

    #[test]
    fn open_initializes_empty_state_file() {
        let dir = temp_store_dir("init");
        let store = open_store(&dir);

        assert!(store.state_file().exists());
        assert_eq!(store.with(|s| s.open_trades.len()), 0);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_state_is_quarantined_not_deleted() {
        let dir = temp_store_dir("corrupt");
        let state_file = dir.join("trade_state.json");
        fs::write(&state_file, "{ this is not json").unwrap();

        let store = open_store(&dir);
        assert_eq!(store.with(|s| s.open_trades.len()), 0);

        // Quarantined copy preserved, canonical file valid again
        let quarantined = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("corrupted_"));
        assert!(quarantined, "expected a corrupted_<ts>.json copy");
        let raw = fs::read_to_string(&state_file).unwrap();
        serde_json::from_str::<TradeState>(&raw).unwrap();

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn save_then_reopen_yields_identical_state() {
        let dir = temp_store_dir("restart");
        let store = open_store(&dir);

        store.with_mut(|s| {
            s.record_open(sample_trade("t1", "EUR_USD"), 1_700_000_000);
            s.remember_signal("abc123".into(), 1_700_000_000, 300);
        });
        store.save();
        store.flush().await;

        let reopened = open_store(&dir);
        let before = store.snapshot();
        let after = reopened.snapshot();
        assert_eq!(
            serde_json::to_value(&before).unwrap(),
            serde_json::to_value(&after).unwrap()
        );
        assert_eq!(after.open_trades.len(), 1);
        assert_eq!(after.global_trade_count, 1);
        assert_eq!(after.last_trade_time.get("EUR_USD"), Some(&1_700_000_000));

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_saves_never_regress_to_a_stale_snapshot() {
        let dir = temp_store_dir("raceseq");
        let store = open_store(&dir);

        // Each save snapshots a newer state; whichever task reaches the
        // write lock last must not undo its predecessors.
        for i in 1..=5u32 {
            store.with_mut(|s| s.global_trade_count = i);
            store.save();
        }
        store.flush().await;

        let reopened = open_store(&dir);
        assert_eq!(reopened.with(|s| s.global_trade_count), 5);

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn torn_temp_file_never_reaches_readers() {
        let dir = temp_store_dir("torn");
        let store = open_store(&dir);

        store.with_mut(|s| s.record_open(sample_trade("t1", "EUR_USD"), 1_700_000_000));
        store.save();
        store.flush().await;

        // Simulate a crash mid-write: a truncated temp file left behind must
        // not affect what readers see in the canonical file.
        fs::write(dir.join("trade_state.json.tmp"), "{\"open_tr").unwrap();

        let reopened = open_store(&dir);
        assert_eq!(reopened.with(|s| s.open_trades.len()), 1);

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn backups_trim_to_max_count_oldest_first() {
        let dir = temp_store_dir("backups");
        let backup_dir = dir.join("state_backups");
        let store = StateStore::open(dir.join("trade_state.json"), &backup_dir, 300, 12).unwrap();
        store.save();
        store.flush().await;

        // Seed 20 fake timestamped backups; trim must keep the 12 newest.
        for i in 0..20 {
            fs::write(
                backup_dir.join(format!("state_20260101T{:02}0000.json", i)),
                "{}",
            )
            .unwrap();
        }
        trim_backups(&backup_dir, 12).await.unwrap();

        let mut names: Vec<String> = fs::read_dir(&backup_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("state_20260101T"))
            .collect();
        names.sort();
        assert!(names.len() <= 12);
        // Oldest seeded entries are gone
        assert!(!names.contains(&"state_20260101T000000.json".to_string()));
        assert!(names.contains(&"state_20260101T190000.json".to_string()));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn close_folds_outcome_into_performance() {
        let mut state = TradeState::default();
        state.record_open(sample_trade("t1", "EUR_USD"), 1_700_000_000);

        let closed = ClosedTrade {
            trade_id: "t1".into(),
            instrument: "EUR_USD".into(),
            direction: Direction::Long,
            units: 10_000,
            entry_price: 1.1000,
            exit_price: 1.1011,
            realized_pnl: 11.0,
            outcome: TradeOutcome::Win,
            exit_reason: "profit_target".into(),
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        };
        state.record_close(&closed);

        // Removed, not archived
        assert!(state.open_trades.is_empty());
        let stats = state.performance.get("EUR_USD").unwrap();
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 0);
        assert!((stats.confidence - 1.0).abs() < 1e-9);
        assert!((stats.realized_pnl - 11.0).abs() < 1e-9);
    }

    #[test]
    fn signal_ttl_pruning() {
        let mut state = TradeState::default();
        state.remember_signal("h1".into(), 1_000, 300);
        assert!(state.has_recent_signal("h1", 1_100, 300));
        assert!(!state.has_recent_signal("h1", 1_500, 300));

        // Insert past the TTL prunes the expired entry
        state.remember_signal("h2".into(), 1_500, 300);
        assert_eq!(state.recent_signals.len(), 1);
    }
}
