//! CSV-backed replay tables: one `<table>.csv` per file in a directory.
//!
//! Files carry either quote columns (`symbol,timestamp,price,bid,ask,volume`)
//! or bar columns (`symbol,timestamp,open,high,low,close,volume`); the shape
//! is detected per row by the presence of `open`, mirroring the wire
//! format. Raw timestamps are epoch integers in the table's [`TimeRep`].

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use tapesim_core::{Bar, MarketRecord, Quote, ReplayBatch, Symbol, TableInfo, TimeRep};

use crate::{group_batches, retain_symbols, DataError, DataResult, DataSource, ReplayStream};

/// Directory of CSV replay tables.
pub struct CsvSource {
    dir: PathBuf,
    default_rep: TimeRep,
    reps: HashMap<String, TimeRep>,
}

impl CsvSource {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, default_rep: TimeRep) -> Self {
        Self {
            dir: dir.into(),
            default_rep,
            reps: HashMap::new(),
        }
    }

    /// Override the time representation of one table.
    #[must_use]
    pub fn with_rep(mut self, table: &str, rep: TimeRep) -> Self {
        self.reps.insert(table.to_string(), rep);
        self
    }

    fn rep_for(&self, table: &str) -> TimeRep {
        self.reps.get(table).copied().unwrap_or(self.default_rep)
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.csv"))
    }

    fn load(&self, table: &str) -> DataResult<Vec<(i64, MarketRecord)>> {
        let path = self.table_path(table);
        if !path.exists() {
            return Err(DataError::UnknownTable(table.to_string()));
        }
        let rep = self.rep_for(table);
        let mut reader = csv::Reader::from_path(&path)?;
        let mut rows = Vec::new();
        for record in reader.deserialize::<CsvRow>() {
            let row = record?;
            let epoch = row.timestamp;
            rows.push((epoch, row.into_record(table, rep)?));
        }
        Ok(rows)
    }
}

#[derive(Deserialize)]
struct CsvRow {
    symbol: String,
    timestamp: i64,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    bid: Option<f64>,
    #[serde(default)]
    ask: Option<f64>,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    close: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
}

impl CsvRow {
    fn into_record(self, table: &str, rep: TimeRep) -> DataResult<MarketRecord> {
        let timestamp = rep
            .from_epoch(self.timestamp)
            .ok_or_else(|| DataError::BadRow {
                table: table.to_string(),
                detail: format!("epoch {} is out of range", self.timestamp),
            })?;
        if let Some(open) = self.open {
            let (Some(high), Some(low), Some(close)) = (self.high, self.low, self.close) else {
                return Err(DataError::BadRow {
                    table: table.to_string(),
                    detail: "bar row is missing high/low/close".into(),
                });
            };
            Ok(MarketRecord::Bar(Bar {
                symbol: self.symbol,
                timestamp,
                open,
                high,
                low,
                close,
                volume: self.volume,
                price: self.price,
            }))
        } else {
            let Some(price) = self.price else {
                return Err(DataError::BadRow {
                    table: table.to_string(),
                    detail: "quote row is missing price".into(),
                });
            };
            Ok(MarketRecord::Quote(Quote {
                symbol: self.symbol,
                timestamp,
                price,
                bid: self.bid,
                ask: self.ask,
                volume: self.volume,
            }))
        }
    }
}

#[async_trait]
impl DataSource for CsvSource {
    async fn tables(&self) -> DataResult<Vec<TableInfo>> {
        let mut infos = Vec::new();
        let mut names: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                (path.extension().and_then(|e| e.to_str()) == Some("csv"))
                    .then(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
                    .flatten()
            })
            .collect();
        names.sort();
        for name in names {
            let rows = self.load(&name)?;
            let rep = self.rep_for(&name);
            let batches = group_batches(&name, rows, rep)?;
            let (Some(first), Some(last)) = (batches.first(), batches.last()) else {
                continue;
            };
            infos.push(TableInfo {
                name,
                start_time: first.timestamp,
                end_time: last.timestamp,
            });
        }
        Ok(infos)
    }

    async fn open(
        &self,
        table: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        symbols: &[Symbol],
    ) -> DataResult<Box<dyn ReplayStream>> {
        let rows = self.load(table)?;
        let rep = self.rep_for(table);
        let mut batches = VecDeque::new();
        for mut batch in group_batches(table, rows, rep)? {
            if batch.timestamp < from || batch.timestamp > to {
                continue;
            }
            retain_symbols(&mut batch.data, symbols);
            if !batch.data.is_empty() {
                batches.push_back(batch);
            }
        }
        Ok(Box::new(CsvStream { batches }))
    }

    fn time_rep(&self, table: &str) -> TimeRep {
        self.rep_for(table)
    }
}

struct CsvStream {
    batches: VecDeque<ReplayBatch>,
}

#[async_trait]
impl ReplayStream for CsvStream {
    async fn next_batch(&mut self) -> DataResult<Option<ReplayBatch>> {
        Ok(self.batches.pop_front())
    }
}
