//! CSV trade journal
//!
//! Append-only record of closed trades for offline analysis. Journal I/O is
//! best-effort: a failed append is logged, never propagated into the trading
//! loop.

use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

use crate::types::ClosedTrade;

/// One journal row per closed trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub timestamp: i64,
    pub trade_id: String,
    pub instrument: String,
    pub direction: String,
    pub units: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub outcome: String,
    pub exit_reason: String,
    pub held_secs: i64,
}

impl JournalRecord {
    pub fn from_closed(closed: &ClosedTrade) -> Self {
        Self {
            timestamp: closed.closed_at.timestamp(),
            trade_id: closed.trade_id.clone(),
            instrument: closed.instrument.clone(),
            direction: closed.direction.to_string(),
            units: closed.units,
            entry_price: closed.entry_price,
            exit_price: closed.exit_price,
            realized_pnl: closed.realized_pnl,
            outcome: closed.outcome.to_string(),
            exit_reason: closed.exit_reason.clone(),
            held_secs: (closed.closed_at - closed.opened_at).num_seconds(),
        }
    }
}

/// Appends closed trades to `<data_dir>/trades.csv`.
pub struct TradeJournal {
    path: PathBuf,
    writer: RwLock<csv::Writer<std::fs::File>>,
}

impl TradeJournal {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data dir {}", dir.display()))?;
        let path = dir.join("trades.csv");

        let needs_header = !path.exists() || path.metadata().map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open journal {}", path.display()))?;
        let writer = WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);

        info!(path = %path.display(), "Trade journal opened");
        Ok(Self {
            path,
            writer: RwLock::new(writer),
        })
    }

    pub async fn append(&self, record: &JournalRecord) -> Result<()> {
        let mut writer = self.writer.write().await;
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
