//! Replay table abstraction: enumerate historical tables and stream their
//! rows as time-ordered batches.
//!
//! A batch is every row sharing one distinct epoch in the table, decoded
//! through the table's [`TimeRep`]. Backends guarantee non-decreasing
//! batch timestamps; the replay orchestrator treats anything else as a
//! corrupt table.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use tapesim_core::{MarketRecord, ReplayBatch, Symbol, TableInfo, TimeRep};

pub mod csv_source;
pub mod demo;
pub mod sqlite;
pub mod validation;

pub use csv_source::CsvSource;
pub use sqlite::SqliteSource;

/// Convenience alias for datasource results.
pub type DataResult<T> = Result<T, DataError>;

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("table {0} is empty")]
    EmptyTable(String),
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("bad row in {table}: {detail}")]
    BadRow { table: String, detail: String },
    #[error("table {0} is not in timestamp order")]
    Unordered(String),
}

/// Enumerates replayable tables and opens time-ordered batch streams.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Every table this source can replay, with its inclusive time range.
    async fn tables(&self) -> DataResult<Vec<TableInfo>>;

    /// Open a stream over `[from, to]`, filtered to the given symbols
    /// (an empty slice means no filter).
    async fn open(
        &self,
        table: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        symbols: &[Symbol],
    ) -> DataResult<Box<dyn ReplayStream>>;

    /// The epoch representation of a table's raw timestamps.
    fn time_rep(&self, table: &str) -> TimeRep;
}

/// Pull-based batch iterator. Dropping the stream releases its resources.
#[async_trait]
pub trait ReplayStream: Send {
    /// The next batch in strictly non-decreasing timestamp order, or
    /// `None` once the range is exhausted.
    async fn next_batch(&mut self) -> DataResult<Option<ReplayBatch>>;
}

/// Group `(raw_epoch, record)` rows into per-epoch batches, verifying the
/// input order.
pub(crate) fn group_batches(
    table: &str,
    rows: Vec<(i64, MarketRecord)>,
    rep: TimeRep,
) -> DataResult<Vec<ReplayBatch>> {
    let mut batches: Vec<ReplayBatch> = Vec::new();
    let mut current: Option<(i64, Vec<MarketRecord>)> = None;
    for (epoch, record) in rows {
        match &mut current {
            Some((open_epoch, data)) if *open_epoch == epoch => data.push(record),
            Some((open_epoch, _)) if *open_epoch > epoch => {
                return Err(DataError::Unordered(table.to_string()));
            }
            _ => {
                if let Some(batch) = flush(table, current.take(), rep)? {
                    batches.push(batch);
                }
                current = Some((epoch, vec![record]));
            }
        }
    }
    if let Some(batch) = flush(table, current, rep)? {
        batches.push(batch);
    }
    Ok(batches)
}

fn flush(
    table: &str,
    group: Option<(i64, Vec<MarketRecord>)>,
    rep: TimeRep,
) -> DataResult<Option<ReplayBatch>> {
    let Some((epoch, data)) = group else {
        return Ok(None);
    };
    let timestamp = rep.from_epoch(epoch).ok_or_else(|| DataError::BadRow {
        table: table.to_string(),
        detail: format!("epoch {epoch} is out of range"),
    })?;
    Ok(Some(ReplayBatch { timestamp, data }))
}

pub(crate) fn retain_symbols(records: &mut Vec<MarketRecord>, symbols: &[Symbol]) {
    if symbols.is_empty() {
        return;
    }
    records.retain(|record| symbols.iter().any(|s| s == record.symbol()));
}

/// In-memory source used by tests and the demo fixtures.
#[derive(Default)]
pub struct MemorySource {
    tables: Vec<MemoryTable>,
}

struct MemoryTable {
    name: String,
    rep: TimeRep,
    batches: Vec<ReplayBatch>,
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table from pre-built records; rows are grouped into
    /// per-epoch batches using the provided representation.
    pub fn with_table(
        mut self,
        name: &str,
        rep: TimeRep,
        records: Vec<MarketRecord>,
    ) -> DataResult<Self> {
        let rows = records
            .into_iter()
            .map(|record| (rep.to_epoch(record.timestamp()), record))
            .collect();
        let batches = group_batches(name, rows, rep)?;
        self.tables.push(MemoryTable {
            name: name.to_string(),
            rep,
            batches,
        });
        Ok(self)
    }

    fn table(&self, name: &str) -> Option<&MemoryTable> {
        self.tables.iter().find(|table| table.name == name)
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn tables(&self) -> DataResult<Vec<TableInfo>> {
        self.tables
            .iter()
            .map(|table| {
                let first = table
                    .batches
                    .first()
                    .ok_or_else(|| DataError::EmptyTable(table.name.clone()))?;
                let last = table
                    .batches
                    .last()
                    .ok_or_else(|| DataError::EmptyTable(table.name.clone()))?;
                Ok(TableInfo {
                    name: table.name.clone(),
                    start_time: first.timestamp,
                    end_time: last.timestamp,
                })
            })
            .collect()
    }

    async fn open(
        &self,
        table: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        symbols: &[Symbol],
    ) -> DataResult<Box<dyn ReplayStream>> {
        let found = self
            .table(table)
            .ok_or_else(|| DataError::UnknownTable(table.to_string()))?;
        let mut batches = VecDeque::new();
        for batch in &found.batches {
            if batch.timestamp < from || batch.timestamp > to {
                continue;
            }
            let mut data = batch.data.clone();
            retain_symbols(&mut data, symbols);
            if !data.is_empty() {
                batches.push_back(ReplayBatch {
                    timestamp: batch.timestamp,
                    data,
                });
            }
        }
        Ok(Box::new(MemoryStream { batches }))
    }

    fn time_rep(&self, table: &str) -> TimeRep {
        self.table(table).map(|t| t.rep).unwrap_or_default()
    }
}

struct MemoryStream {
    batches: VecDeque<ReplayBatch>,
}

#[async_trait]
impl ReplayStream for MemoryStream {
    async fn next_batch(&mut self) -> DataResult<Option<ReplayBatch>> {
        Ok(self.batches.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tapesim_core::Quote;

    fn quote(symbol: &str, seconds: i64, price: f64) -> MarketRecord {
        let ts = Utc.timestamp_opt(1_600_000_000 + seconds, 0).unwrap();
        MarketRecord::Quote(Quote {
            symbol: symbol.into(),
            timestamp: ts,
            price,
            bid: None,
            ask: None,
            volume: None,
        })
    }

    fn rep() -> TimeRep {
        TimeRep::default()
    }

    #[tokio::test]
    async fn memory_source_groups_rows_by_epoch() {
        let source = MemorySource::new()
            .with_table(
                "trades",
                rep(),
                vec![
                    quote("X", 0, 1.0),
                    quote("Y", 0, 2.0),
                    quote("X", 1, 1.1),
                ],
            )
            .unwrap();
        let mut stream = source
            .open(
                "trades",
                DateTime::<Utc>::MIN_UTC,
                DateTime::<Utc>::MAX_UTC,
                &[],
            )
            .await
            .unwrap();
        let first = stream.next_batch().await.unwrap().unwrap();
        assert_eq!(first.data.len(), 2);
        let second = stream.next_batch().await.unwrap().unwrap();
        assert_eq!(second.data.len(), 1);
        assert!(second.timestamp > first.timestamp);
        assert!(stream.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn symbol_filter_drops_foreign_rows() {
        let source = MemorySource::new()
            .with_table(
                "trades",
                rep(),
                vec![quote("X", 0, 1.0), quote("Y", 0, 2.0), quote("Y", 1, 2.1)],
            )
            .unwrap();
        let mut stream = source
            .open(
                "trades",
                DateTime::<Utc>::MIN_UTC,
                DateTime::<Utc>::MAX_UTC,
                &["X".to_string()],
            )
            .await
            .unwrap();
        let first = stream.next_batch().await.unwrap().unwrap();
        assert_eq!(first.data.len(), 1);
        assert_eq!(first.data[0].symbol(), "X");
        // The Y-only epoch disappears entirely.
        assert!(stream.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn table_info_reports_inclusive_range() {
        let source = MemorySource::new()
            .with_table("trades", rep(), vec![quote("X", 0, 1.0), quote("X", 9, 1.0)])
            .unwrap();
        let tables = source.tables().await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!((tables[0].end_time - tables[0].start_time).num_seconds(), 9);
    }

    #[test]
    fn unordered_rows_are_rejected() {
        let rows = vec![(5, quote("X", 5, 1.0)), (3, quote("X", 3, 1.0))];
        assert!(matches!(
            group_batches("t", rows, rep()),
            Err(DataError::Unordered(_))
        ));
    }
}
