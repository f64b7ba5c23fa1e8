//! Replay table validation: stream a table end to end and report the
//! problems a replay would trip over.
//!
//! Backends are trusted to order batches; bad source data (duplicate
//! epochs collapse fine, but gaps, zero volume and non-positive prices
//! don't) tends to surface mid-replay otherwise. Running a check before
//! serving a new table is cheaper than debugging a truncated stream.

use chrono::{DateTime, Duration, Utc};

use tapesim_core::MarketRecord;

use crate::{DataResult, DataSource};

/// Tunables for one validation run.
#[derive(Clone, Copy, Debug)]
pub struct ValidationConfig {
    /// Batch-to-batch spacing above which a gap is flagged. `None`
    /// disables gap detection.
    pub max_gap: Option<Duration>,
    /// Flag close-to-close moves larger than this fraction.
    pub price_jump_threshold: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_gap: None,
            price_jump_threshold: 0.05,
        }
    }
}

/// One spacing anomaly between consecutive batches.
#[derive(Clone, Debug)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One suspicious price move.
#[derive(Clone, Debug)]
pub struct PriceSpike {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub change_fraction: f64,
}

/// Everything a validation run found.
#[derive(Clone, Debug, Default)]
pub struct ValidationSummary {
    pub batches: usize,
    pub rows: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub zero_volume_rows: usize,
    pub non_positive_prices: usize,
    pub gaps: Vec<Gap>,
    pub price_spikes: Vec<PriceSpike>,
}

impl ValidationSummary {
    /// True when the table is safe to replay as-is.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.non_positive_prices == 0 && self.gaps.is_empty() && self.price_spikes.is_empty()
    }
}

/// Stream an entire table through the given source and summarize what a
/// replay would encounter.
pub async fn validate_table(
    source: &dyn DataSource,
    table: &str,
    config: ValidationConfig,
) -> DataResult<ValidationSummary> {
    let mut stream = source
        .open(
            table,
            DateTime::<Utc>::MIN_UTC,
            DateTime::<Utc>::MAX_UTC,
            &[],
        )
        .await?;

    let mut summary = ValidationSummary::default();
    let mut last_ts: Option<DateTime<Utc>> = None;
    let mut last_price: std::collections::HashMap<String, f64> = std::collections::HashMap::new();

    while let Some(batch) = stream.next_batch().await? {
        summary.batches += 1;
        summary.rows += batch.data.len();
        if summary.start.is_none() {
            summary.start = Some(batch.timestamp);
        }
        if let (Some(previous), Some(max_gap)) = (last_ts, config.max_gap) {
            if batch.timestamp - previous > max_gap {
                summary.gaps.push(Gap {
                    start: previous,
                    end: batch.timestamp,
                });
            }
        }
        for record in &batch.data {
            let price = record.mark_price();
            if price <= 0.0 {
                summary.non_positive_prices += 1;
            }
            if record.volume() == Some(0.0) {
                summary.zero_volume_rows += 1;
            }
            if let MarketRecord::Bar(bar) = record {
                if bar.low > bar.high {
                    summary.non_positive_prices += 1;
                }
            }
            if let Some(previous) = last_price.get(record.symbol()) {
                if *previous > 0.0 {
                    let change = (price - previous).abs() / previous;
                    if change > config.price_jump_threshold {
                        summary.price_spikes.push(PriceSpike {
                            symbol: record.symbol().to_string(),
                            timestamp: batch.timestamp,
                            change_fraction: change,
                        });
                    }
                }
            }
            last_price.insert(record.symbol().to_string(), price);
        }
        last_ts = Some(batch.timestamp);
        summary.end = Some(batch.timestamp);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemorySource;
    use chrono::TimeZone;
    use tapesim_core::{Quote, TimeRep};

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

    #[tokio::test]
    async fn clean_table_validates_clean() {
        let source = MemorySource::new()
            .with_table(
                "t",
                TimeRep::default(),
                vec![quote("X", 0, 100.0), quote("X", 1, 100.5), quote("X", 2, 101.0)],
            )
            .unwrap();
        let summary = validate_table(&source, "t", ValidationConfig::default())
            .await
            .unwrap();
        assert!(summary.is_clean());
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.rows, 3);
    }

    #[tokio::test]
    async fn gaps_and_spikes_are_flagged() {
        let source = MemorySource::new()
            .with_table(
                "t",
                TimeRep::default(),
                vec![
                    quote("X", 0, 100.0),
                    quote("X", 1, 120.0),  // 20% jump
                    quote("X", 600, 120.0), // ten minute hole
                ],
            )
            .unwrap();
        let config = ValidationConfig {
            max_gap: Some(Duration::seconds(60)),
            price_jump_threshold: 0.05,
        };
        let summary = validate_table(&source, "t", config).await.unwrap();
        assert!(!summary.is_clean());
        assert_eq!(summary.gaps.len(), 1);
        assert_eq!(summary.price_spikes.len(), 1);
        assert_eq!(summary.price_spikes[0].symbol, "X");
    }
}
