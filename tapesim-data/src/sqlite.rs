//! SQLite-backed replay tables: one database, one SQL table per replay
//! table.
//!
//! Tables use the same two column shapes as the CSV backend; the shape is
//! detected from the schema (`open` column present means bars). Streams
//! page over distinct epochs so only one batch's rows are resident at a
//! time. One `Connection` is opened per stream; the backing file is shared
//! across connections and replay sessions.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use tapesim_core::{Bar, MarketRecord, Quote, ReplayBatch, Symbol, TableInfo, TimeRep};

use crate::{DataError, DataResult, DataSource, ReplayStream};

/// Column layout of one replay table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TableShape {
    Quotes,
    Bars,
}

/// SQLite datasource; cheap to clone per connection.
#[derive(Clone)]
pub struct SqliteSource {
    path: PathBuf,
    default_rep: TimeRep,
    reps: HashMap<String, TimeRep>,
}

impl SqliteSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, default_rep: TimeRep) -> Self {
        Self {
            path: path.into(),
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

    fn connect(&self) -> DataResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(conn)
    }

    /// Create an empty replay table with the given shape.
    pub fn create_table(&self, name: &str, shape: TableShape) -> DataResult<()> {
        let name = checked_identifier(name)?;
        let conn = self.connect()?;
        let columns = match shape {
            TableShape::Quotes => {
                "symbol TEXT NOT NULL, timestamp INTEGER NOT NULL, price REAL NOT NULL, \
                 bid REAL, ask REAL, volume REAL"
            }
            TableShape::Bars => {
                "symbol TEXT NOT NULL, timestamp INTEGER NOT NULL, open REAL NOT NULL, \
                 high REAL NOT NULL, low REAL NOT NULL, close REAL NOT NULL, volume REAL"
            }
        };
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" ({columns});\
             CREATE INDEX IF NOT EXISTS \"idx_{name}_ts\" ON \"{name}\" (timestamp);"
        ))?;
        Ok(())
    }

    /// Append records to a table, encoding timestamps through its
    /// representation. Returns the number of rows written.
    pub fn append(&self, name: &str, records: &[MarketRecord]) -> DataResult<usize> {
        let name = checked_identifier(name)?;
        let rep = self.rep_for(&name);
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for record in records {
            let epoch = rep.to_epoch(record.timestamp());
            match record {
                MarketRecord::Quote(quote) => {
                    tx.execute(
                        &format!(
                            "INSERT INTO \"{name}\" (symbol, timestamp, price, bid, ask, volume) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                        ),
                        rusqlite::params![
                            quote.symbol,
                            epoch,
                            quote.price,
                            quote.bid,
                            quote.ask,
                            quote.volume
                        ],
                    )?;
                }
                MarketRecord::Bar(bar) => {
                    tx.execute(
                        &format!(
                            "INSERT INTO \"{name}\" (symbol, timestamp, open, high, low, close, volume) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                        ),
                        rusqlite::params![
                            bar.symbol,
                            epoch,
                            bar.open,
                            bar.high,
                            bar.low,
                            bar.close,
                            bar.volume
                        ],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn table_names(conn: &Connection) -> DataResult<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn shape(conn: &Connection, table: &str) -> DataResult<TableShape> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Err(DataError::UnknownTable(table.to_string()));
        }
        if columns.iter().any(|c| c == "open") {
            Ok(TableShape::Bars)
        } else {
            Ok(TableShape::Quotes)
        }
    }
}

#[async_trait]
impl DataSource for SqliteSource {
    async fn tables(&self) -> DataResult<Vec<TableInfo>> {
        let conn = self.connect()?;
        let mut infos = Vec::new();
        for name in Self::table_names(&conn)? {
            let range: (Option<i64>, Option<i64>) = conn.query_row(
                &format!("SELECT MIN(timestamp), MAX(timestamp) FROM \"{name}\""),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let (Some(min), Some(max)) = range else {
                debug!(table = %name, "skipping empty replay table");
                continue;
            };
            let rep = self.rep_for(&name);
            let (Some(start_time), Some(end_time)) = (rep.from_epoch(min), rep.from_epoch(max))
            else {
                return Err(DataError::BadRow {
                    table: name,
                    detail: "table range is out of epoch bounds".into(),
                });
            };
            infos.push(TableInfo {
                name,
                start_time,
                end_time,
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
        let table = checked_identifier(table)?;
        let conn = self.connect()?;
        let shape = Self::shape(&conn, &table)?;
        let rep = self.rep_for(&table);

        let mut sql = format!(
            "SELECT DISTINCT timestamp FROM \"{table}\" \
             WHERE timestamp >= ?1 AND timestamp <= ?2"
        );
        let mut params: Vec<Value> =
            vec![Value::Integer(rep.to_epoch(from)), Value::Integer(rep.to_epoch(to))];
        if !symbols.is_empty() {
            sql.push_str(&format!(" AND symbol IN ({})", placeholders(3, symbols.len())));
            params.extend(symbols.iter().map(|s| Value::Text(s.clone())));
        }
        sql.push_str(" ORDER BY timestamp");

        let epochs: VecDeque<i64> = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params), |row| row.get::<_, i64>(0))?
                .collect::<Result<_, _>>()?;
            rows
        };
        debug!(table = %table, batches = epochs.len(), "opened sqlite replay stream");

        Ok(Box::new(SqliteStream {
            conn,
            table,
            shape,
            rep,
            symbols: symbols.to_vec(),
            epochs,
        }))
    }

    fn time_rep(&self, table: &str) -> TimeRep {
        self.rep_for(table)
    }
}

struct SqliteStream {
    conn: Connection,
    table: String,
    shape: TableShape,
    rep: TimeRep,
    symbols: Vec<Symbol>,
    epochs: VecDeque<i64>,
}

#[async_trait]
impl ReplayStream for SqliteStream {
    async fn next_batch(&mut self) -> DataResult<Option<ReplayBatch>> {
        let Some(epoch) = self.epochs.pop_front() else {
            return Ok(None);
        };
        let timestamp = self
            .rep
            .from_epoch(epoch)
            .ok_or_else(|| DataError::BadRow {
                table: self.table.clone(),
                detail: format!("epoch {epoch} is out of range"),
            })?;

        let columns = match self.shape {
            TableShape::Quotes => "symbol, price, bid, ask, volume",
            TableShape::Bars => "symbol, open, high, low, close, volume",
        };
        let mut sql = format!(
            "SELECT {columns} FROM \"{}\" WHERE timestamp = ?1",
            self.table
        );
        let mut params: Vec<Value> = vec![Value::Integer(epoch)];
        if !self.symbols.is_empty() {
            sql.push_str(&format!(
                " AND symbol IN ({})",
                placeholders(2, self.symbols.len())
            ));
            params.extend(self.symbols.iter().map(|s| Value::Text(s.clone())));
        }
        sql.push_str(" ORDER BY rowid");

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let shape = self.shape;
        let data = stmt
            .query_map(params_from_iter(params), |row| {
                Ok(match shape {
                    TableShape::Quotes => MarketRecord::Quote(Quote {
                        symbol: row.get(0)?,
                        timestamp,
                        price: row.get(1)?,
                        bid: row.get(2)?,
                        ask: row.get(3)?,
                        volume: row.get(4)?,
                    }),
                    TableShape::Bars => MarketRecord::Bar(Bar {
                        symbol: row.get(0)?,
                        timestamp,
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get(5)?,
                        price: None,
                    }),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ReplayBatch { timestamp, data }))
    }
}

fn placeholders(start: usize, count: usize) -> String {
    (0..count)
        .map(|idx| format!("?{}", start + idx))
        .collect::<Vec<_>>()
        .join(", ")
}

fn checked_identifier(name: &str) -> DataResult<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(name.to_string())
    } else {
        Err(DataError::UnknownTable(name.to_string()))
    }
}
