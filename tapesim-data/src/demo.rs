//! Deterministic demo fixtures for quick starts and tests.

use chrono::{DateTime, Duration, Utc};

use tapesim_core::{Bar, MarketRecord};

use crate::sqlite::{SqliteSource, TableShape};
use crate::DataResult;

/// Generate a deterministic sine-wave bar series for each symbol. One bar
/// per symbol per step, so every epoch carries `symbols.len()` rows.
#[must_use]
pub fn demo_bars(
    symbols: &[&str],
    len: usize,
    start: DateTime<Utc>,
    step: Duration,
) -> Vec<MarketRecord> {
    let mut records = Vec::with_capacity(len * symbols.len());
    for idx in 0..len {
        let timestamp = start + step * idx as i32;
        for (offset, symbol) in symbols.iter().enumerate() {
            let base = 100.0 * (offset + 1) as f64;
            let phase = idx as f64 / 10.0 + offset as f64;
            let open = base + phase.sin() * 5.0;
            let close = base + (phase + 0.1).sin() * 5.0;
            records.push(MarketRecord::Bar(Bar {
                symbol: (*symbol).to_string(),
                timestamp,
                open,
                high: open.max(close) + 1.0,
                low: open.min(close) - 1.0,
                close,
                volume: Some(1_000.0 + (idx % 7) as f64 * 100.0),
                price: None,
            }));
        }
    }
    records
}

/// Write a demo bar table into a SQLite source. Returns the row count.
pub fn seed_sqlite(
    source: &SqliteSource,
    table: &str,
    symbols: &[&str],
    len: usize,
    start: DateTime<Utc>,
    step: Duration,
) -> DataResult<usize> {
    source.create_table(table, TableShape::Bars)?;
    source.append(table, &demo_bars(symbols, len, start, step))
}
