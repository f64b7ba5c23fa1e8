//! Online performance statistics updated on every replay tick.
//!
//! Each client owns three trackers (periodic, per-trade, end-of-day) that
//! share the same estimator set. `update` feeds mark-to-market equity
//! returns, `record_trade` feeds realised PnL outcomes, and `report` is a
//! pure read: calling it twice without an intervening update yields
//! identical numbers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tapesim_core::{Position, PriceSnapshot};

/// Which cadence produced a report.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ReportKind {
    #[serde(rename = "PERIODIC")]
    Periodic,
    #[serde(rename = "TRADE")]
    Trade,
    #[serde(rename = "ENDOFDAY")]
    EndOfDay,
}

/// Snapshot of every estimator at one instant.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub report_type: ReportKind,
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub total_return: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub win_rate: f64,
    pub avg_gain_loss_ratio: f64,
    pub expectancy: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub max_drawdown_duration: i64,
}

/// Welford accumulator over per-batch returns, with a downside branch for
/// the Sortino denominator.
#[derive(Clone, Debug, Default)]
struct ReturnStats {
    count: u64,
    mean: f64,
    m2: f64,
    downside_sq_sum: f64,
    downside_count: u64,
}

impl ReturnStats {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        if value < 0.0 {
            self.downside_sq_sum += value * value;
            self.downside_count += 1;
        }
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }

    fn downside_dev(&self) -> f64 {
        if self.downside_count == 0 {
            return 0.0;
        }
        (self.downside_sq_sum / self.downside_count as f64).sqrt()
    }

    fn sharpe(&self, risk_free: f64) -> f64 {
        let std_dev = self.std_dev();
        if std_dev > 1e-12 {
            (self.mean - risk_free) / std_dev
        } else {
            0.0
        }
    }

    fn sortino(&self, risk_free: f64) -> f64 {
        let downside = self.downside_dev();
        if downside > 1e-12 {
            (self.mean - risk_free) / downside
        } else {
            0.0
        }
    }
}

/// Win/loss bookkeeping over realised trade outcomes.
#[derive(Clone, Debug, Default)]
struct TradeStats {
    wins: u64,
    flat: u64,
    losses: u64,
    total_gain: f64,
    total_loss: f64,
}

impl TradeStats {
    fn record(&mut self, pnl: f64) {
        if pnl > 0.0 {
            self.wins += 1;
            self.total_gain += pnl;
        } else if pnl < 0.0 {
            self.losses += 1;
            self.total_loss += -pnl;
        } else {
            self.flat += 1;
        }
    }

    fn total(&self) -> u64 {
        self.wins + self.flat + self.losses
    }

    fn win_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.wins as f64 / total as f64
    }

    fn avg_gain(&self) -> f64 {
        if self.wins == 0 {
            return 0.0;
        }
        self.total_gain / self.wins as f64
    }

    fn avg_loss(&self) -> f64 {
        if self.losses == 0 {
            return 0.0;
        }
        self.total_loss / self.losses as f64
    }

    fn gain_loss_ratio(&self) -> f64 {
        let avg_loss = self.avg_loss();
        if avg_loss > 1e-12 {
            self.avg_gain() / avg_loss
        } else if self.wins > 0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    fn expectancy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.total_gain - self.total_loss) / total as f64
    }

    fn profit_factor(&self) -> f64 {
        if self.total_loss > 1e-12 {
            self.total_gain / self.total_loss
        } else if self.total_gain > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }
}

/// Running peak/drawdown walk keyed by timestamp.
#[derive(Clone, Debug)]
struct DrawdownStats {
    peak: f64,
    peak_ts: Option<DateTime<Utc>>,
    max_drawdown: f64,
    longest_underwater_ms: i64,
}

impl DrawdownStats {
    fn new(initial_equity: f64) -> Self {
        Self {
            peak: initial_equity,
            peak_ts: None,
            max_drawdown: 0.0,
            longest_underwater_ms: 0,
        }
    }

    fn observe(&mut self, equity: f64, ts: DateTime<Utc>) {
        if equity >= self.peak {
            self.peak = equity;
            self.peak_ts = Some(ts);
            return;
        }
        if self.peak > 0.0 {
            let drawdown = (self.peak - equity) / self.peak;
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
        if let Some(peak_ts) = self.peak_ts {
            let underwater = (ts - peak_ts).num_milliseconds();
            if underwater > self.longest_underwater_ms {
                self.longest_underwater_ms = underwater;
            }
        }
    }
}

/// One cadence's worth of running estimators.
#[derive(Clone, Debug)]
pub struct MetricsTracker {
    risk_free: f64,
    initial_equity: f64,
    prev_equity: f64,
    returns: ReturnStats,
    trades: TradeStats,
    drawdown: DrawdownStats,
}

impl MetricsTracker {
    #[must_use]
    pub fn new(initial_equity: f64, risk_free: f64) -> Self {
        Self {
            risk_free,
            initial_equity,
            prev_equity: initial_equity,
            returns: ReturnStats::default(),
            trades: TradeStats::default(),
            drawdown: DrawdownStats::new(initial_equity),
        }
    }

    /// Mark the position to the snapshot, push the equity return and
    /// advance the drawdown walk.
    pub fn update(&mut self, position: &Position, snapshot: &PriceSnapshot) {
        let equity = position.market_value(snapshot);
        let ts = snapshot.timestamp().unwrap_or(position.modified);
        if self.prev_equity.abs() > 1e-12 {
            self.returns
                .push((equity - self.prev_equity) / self.prev_equity);
        }
        self.drawdown.observe(equity, ts);
        self.prev_equity = equity;
    }

    /// Feed one realised trade outcome.
    pub fn record_trade(&mut self, realised_pnl: f64) {
        self.trades.record(realised_pnl);
    }

    /// Reseed every estimator at the given equity (end-of-day rollover).
    pub fn reset(&mut self, equity: f64) {
        self.initial_equity = equity;
        self.prev_equity = equity;
        self.returns = ReturnStats::default();
        self.trades = TradeStats::default();
        self.drawdown = DrawdownStats::new(equity);
    }

    /// Produce a report. Pure: repeated calls without intervening updates
    /// return identical numbers.
    #[must_use]
    pub fn report(
        &self,
        kind: ReportKind,
        position: &Position,
        snapshot: &PriceSnapshot,
        ts: DateTime<Utc>,
    ) -> MetricsReport {
        let equity = position.market_value(snapshot);
        let total_return = if self.initial_equity.abs() > 1e-12 {
            equity / self.initial_equity - 1.0
        } else {
            0.0
        };
        MetricsReport {
            report_type: kind,
            timestamp: ts,
            equity,
            total_return,
            sharpe: self.returns.sharpe(self.risk_free),
            sortino: self.returns.sortino(self.risk_free),
            win_rate: self.trades.win_rate(),
            avg_gain_loss_ratio: self.trades.gain_loss_ratio(),
            expectancy: self.trades.expectancy(),
            profit_factor: self.trades.profit_factor(),
            max_drawdown: self.drawdown.max_drawdown,
            max_drawdown_duration: self.drawdown.longest_underwater_ms,
        }
    }
}
