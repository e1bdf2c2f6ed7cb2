//! Durable event journal
//!
//! Append-only CSV files, one per kind and UTC day:
//! `fills/fills_2024-06-01.csv`, `signals/`, `risk/`, `exits/`,
//! `arbitrage/`, `reconcile/`. Every append is flushed before it returns,
//! so a caller that got `Ok` may treat the row as committed. An external
//! sync process tails these files; nothing here depends on it.
//!
//! Also holds the JSON state snapshot written at shutdown.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::types::Fill;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalKind {
    Fills,
    Signals,
    Risk,
    Exits,
    Arbitrage,
    Reconcile,
    Sets,
}

impl JournalKind {
    pub const ALL: [JournalKind; 7] = [
        JournalKind::Fills,
        JournalKind::Signals,
        JournalKind::Risk,
        JournalKind::Exits,
        JournalKind::Arbitrage,
        JournalKind::Reconcile,
        JournalKind::Sets,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            JournalKind::Fills => "fills",
            JournalKind::Signals => "signals",
            JournalKind::Risk => "risk",
            JournalKind::Exits => "exits",
            JournalKind::Arbitrage => "arbitrage",
            JournalKind::Reconcile => "reconcile",
            JournalKind::Sets => "sets",
        }
    }
}

/// Fill row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub timestamp: i64,
    pub kind: String,
    pub fill_id: String,
    pub order_id: String,
    pub market_id: String,
    pub outcome: String,
    pub side: String,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    pub strategy: String,
}

impl From<&Fill> for FillRecord {
    fn from(fill: &Fill) -> Self {
        Self {
            timestamp: fill.timestamp.timestamp_millis(),
            kind: "fill".to_string(),
            fill_id: fill.fill_id.clone(),
            order_id: fill.order_id.clone(),
            market_id: fill.market_id.clone(),
            outcome: fill.outcome.to_string(),
            side: fill.side.to_string(),
            price: fill.price,
            size: fill.size,
            fee: fill.fee,
            strategy: fill.strategy.to_string(),
        }
    }
}

/// Directional signal transition row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub timestamp: i64,
    pub kind: String,
    pub market_id: String,
    pub outcome: String,
    pub from_state: String,
    pub to_state: String,
    pub model_probability: f64,
    pub market_probability: f64,
    pub edge_pts: f64,
    pub confirmations: u32,
}

/// Risk state change row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRecord {
    pub timestamp: i64,
    pub kind: String,
    #[serde(default)]
    pub market_id: Option<String>,
    #[serde(default)]
    pub drawdown_pct: Option<f64>,
    pub detail: String,
}

/// Directional exit row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRecord {
    pub timestamp: i64,
    pub kind: String,
    pub market_id: String,
    pub outcome: String,
    pub reason: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub pnl: f64,
    #[serde(default)]
    pub oracle_note: Option<String>,
}

/// Arbitrage execution row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageRecord {
    pub timestamp: i64,
    pub kind: String,
    pub market_id: String,
    pub yes_price: f64,
    pub no_price: f64,
    pub size: f64,
    pub expected_profit: f64,
    pub status: String,
}

/// Complete-set merge or split row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetConversionRecord {
    pub timestamp: i64,
    /// `merge` or `split`
    pub kind: String,
    pub market_id: String,
    pub pairs: f64,
    pub realized: f64,
}

/// Local vs exchange divergence row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceRecord {
    pub timestamp: i64,
    pub kind: String,
    pub market_id: String,
    pub outcome: String,
    pub local_size: f64,
    pub exchange_size: f64,
}

struct DailyWriter {
    date: String,
    writer: csv::Writer<std::fs::File>,
}

/// Append-only CSV journal. A disabled journal accepts and drops every row.
pub struct EventJournal {
    data_dir: Option<PathBuf>,
    writers: Mutex<HashMap<JournalKind, DailyWriter>>,
}

impl EventJournal {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        for kind in JournalKind::ALL {
            fs::create_dir_all(data_dir.join(kind.dir_name()))
                .with_context(|| format!("Failed to create {} directory", kind.dir_name()))?;
        }
        info!(dir = %data_dir.display(), "Event journal ready");
        Ok(Self {
            data_dir: Some(data_dir),
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn disabled() -> Self {
        Self {
            data_dir: None,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.data_dir.is_some()
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    fn create_writer(dir: &Path, filename: &str) -> Result<csv::Writer<std::fs::File>> {
        let path = dir.join(filename);
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open CSV file")?;

        Ok(WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file))
    }

    /// Serialize one row and flush it
    pub async fn append<T: Serialize>(
        &self,
        kind: JournalKind,
        at: DateTime<Utc>,
        record: &T,
    ) -> Result<()> {
        let Some(data_dir) = &self.data_dir else {
            return Ok(());
        };
        let date = at.format("%Y-%m-%d").to_string();
        let mut writers = self.writers.lock().await;

        let stale = writers.get(&kind).map_or(true, |w| w.date != date);
        if stale {
            let name = kind.dir_name();
            let writer = Self::create_writer(
                &data_dir.join(name),
                &format!("{}_{}.csv", name, date),
            )?;
            writers.insert(kind, DailyWriter { date, writer });
        }

        let entry = writers
            .get_mut(&kind)
            .context("journal writer missing after open")?;
        entry
            .writer
            .serialize(record)
            .with_context(|| format!("Failed to write {} record", kind.dir_name()))?;
        entry
            .writer
            .flush()
            .with_context(|| format!("Failed to flush {} writer", kind.dir_name()))?;
        debug!(kind = kind.dir_name(), "Journal row committed");
        Ok(())
    }

    pub async fn record_fill(&self, fill: &Fill) -> Result<()> {
        self.append(JournalKind::Fills, fill.timestamp, &FillRecord::from(fill))
            .await
    }

    pub async fn record_signal(&self, record: &SignalRecord) -> Result<()> {
        self.append(JournalKind::Signals, millis_to_time(record.timestamp), record)
            .await
    }

    pub async fn record_risk(&self, record: &RiskRecord) -> Result<()> {
        self.append(JournalKind::Risk, millis_to_time(record.timestamp), record)
            .await
    }

    pub async fn record_exit(&self, record: &ExitRecord) -> Result<()> {
        self.append(JournalKind::Exits, millis_to_time(record.timestamp), record)
            .await
    }

    pub async fn record_arbitrage(&self, record: &ArbitrageRecord) -> Result<()> {
        self.append(JournalKind::Arbitrage, millis_to_time(record.timestamp), record)
            .await
    }

    pub async fn record_set_conversion(&self, record: &SetConversionRecord) -> Result<()> {
        self.append(JournalKind::Sets, millis_to_time(record.timestamp), record)
            .await
    }

    pub async fn record_divergence(&self, record: &DivergenceRecord) -> Result<()> {
        self.append(JournalKind::Reconcile, millis_to_time(record.timestamp), record)
            .await
    }

    /// Write a JSON snapshot atomically (temp file + rename)
    pub fn save_snapshot<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let Some(data_dir) = &self.data_dir else {
            return Ok(());
        };
        let path = data_dir.join(format!("{}.json", name));
        let tmp = data_dir.join(format!("{}.json.tmp", name));
        let body = serde_json::to_vec_pretty(value).context("Failed to serialize snapshot")?;
        fs::write(&tmp, body).context("Failed to write snapshot")?;
        fs::rename(&tmp, &path).context("Failed to move snapshot into place")?;
        debug!(path = %path.display(), "💾 Snapshot saved");
        Ok(())
    }

    pub fn load_snapshot<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let Some(data_dir) = &self.data_dir else {
            return Ok(None);
        };
        let path = data_dir.join(format!("{}.json", name));
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).context("Failed to read snapshot")?;
        let value = serde_json::from_slice(&raw).context("Failed to parse snapshot")?;
        Ok(Some(value))
    }
}

fn millis_to_time(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
