//! Session state: one [`ClientSession`] per logical trading client, one
//! [`ConnectionSession`] per transport.
//!
//! A client session owns its broker, its three metrics trackers and its
//! subscription set; the connection session owns the client map, the
//! active-replay flag and the time representation negotiated at `init`.
//! Everything here is single-writer: the transport task is the only
//! mutator, so no locking lives at this layer.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use thiserror::Error;
use tracing::warn;

use tapesim_broker::Broker;
use tapesim_core::{
    Cid, Fill, MarketRecord, OrderState, PriceSnapshot, ReplayBatch, SimConfig, Symbol, TimeRep,
    WILDCARD_SYMBOL,
};
use tapesim_metrics::{MetricsReport, MetricsTracker, ReportKind};

/// Session-level failures the router maps onto wire error codes.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    #[error("a replay is active on this connection")]
    ReplayActive,
    #[error("a replay is already active on this connection")]
    ReplayAlreadyActive,
    #[error("unknown client: {0}")]
    UnknownClient(Cid),
}

/// Per-client reporting cadence, snapshotted from replay params.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReportingFlags {
    /// Emit a PERIODIC report every N market batches (0 disables).
    pub periodic_period: u32,
    pub trade_report: bool,
    pub eod_report: bool,
}

/// Event produced by a client session during a replay tick, addressed to
/// its own cid.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Order {
        updated: Vec<OrderState>,
        fills: Vec<Fill>,
    },
    Metrics(MetricsReport),
}

/// One logical trading client: broker, metrics, subscriptions and replay
/// cursor.
pub struct ClientSession {
    cid: Cid,
    subscriptions: BTreeSet<Symbol>,
    broker: Broker,
    periodic: MetricsTracker,
    trade: MetricsTracker,
    eod: MetricsTracker,
    flags: ReportingFlags,
    replay_time: Option<DateTime<Utc>>,
    event_counter: u64,
    current_day: Option<i64>,
    frozen: bool,
}

impl ClientSession {
    #[must_use]
    pub fn new(cid: Cid, config: SimConfig, now: DateTime<Utc>) -> Self {
        let equity = config.initial_cash;
        let risk_free = config.risk_free;
        Self {
            cid,
            subscriptions: BTreeSet::new(),
            broker: Broker::new(config, now),
            periodic: MetricsTracker::new(equity, risk_free),
            trade: MetricsTracker::new(equity, risk_free),
            eod: MetricsTracker::new(equity, risk_free),
            flags: ReportingFlags::default(),
            replay_time: None,
            event_counter: 0,
            current_day: None,
            frozen: false,
        }
    }

    #[must_use]
    pub fn cid(&self) -> &str {
        &self.cid
    }

    #[must_use]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut Broker {
        &mut self.broker
    }

    #[must_use]
    pub fn replay_time(&self) -> Option<DateTime<Utc>> {
        self.replay_time
    }

    /// Reporting cadence snapshot taken when a replay starts.
    pub fn set_flags(&mut self, flags: ReportingFlags) {
        self.flags = flags;
    }

    /// Freeze subscriptions and reset the per-replay cursors. While a
    /// replay is active subscription changes are accepted but ignored;
    /// the snapshot taken here stays authoritative.
    pub fn begin_replay(&mut self) {
        self.frozen = true;
        self.event_counter = 0;
        self.current_day = None;
    }

    /// Thaw subscriptions once the replay has finished.
    pub fn end_replay(&mut self) {
        self.frozen = false;
    }

    /// Add subscriptions, returning the symbols actually added. `"*"` is
    /// a valid member meaning "match everything".
    pub fn add_subscriptions(&mut self, symbols: Vec<Symbol>) -> Vec<Symbol> {
        if self.frozen {
            return Vec::new();
        }
        symbols
            .into_iter()
            .filter(|symbol| self.subscriptions.insert(symbol.clone()))
            .collect()
    }

    /// Remove subscriptions, returning the symbols actually removed.
    pub fn remove_subscriptions(&mut self, symbols: &[Symbol]) -> Vec<Symbol> {
        if self.frozen {
            return Vec::new();
        }
        symbols
            .iter()
            .filter(|symbol| self.subscriptions.remove(*symbol))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn subscriptions(&self) -> &BTreeSet<Symbol> {
        &self.subscriptions
    }

    #[must_use]
    pub fn has_wildcard(&self) -> bool {
        self.subscriptions.contains(WILDCARD_SYMBOL)
    }

    /// The part of a batch this client is subscribed to.
    #[must_use]
    pub fn subscribed_slice(&self, batch: &ReplayBatch) -> Vec<MarketRecord> {
        if self.has_wildcard() {
            return batch.data.clone();
        }
        batch
            .data
            .iter()
            .filter(|record| self.subscriptions.contains(record.symbol()))
            .cloned()
            .collect()
    }

    /// Advance the replay cursor; stamps subsequent broker mutations.
    pub fn advance_clock(&mut self, ts: DateTime<Utc>) {
        self.replay_time = Some(ts);
        self.broker.set_clock(ts);
    }

    /// Phase 1 of a replay tick: run the matching pass and fold fills
    /// into the metrics trackers.
    pub fn process_order_update(
        &mut self,
        batch: &ReplayBatch,
        snapshot: &PriceSnapshot,
    ) -> Vec<SessionEvent> {
        let outcome = self.broker.process_batch(batch);
        if outcome.is_empty() {
            return Vec::new();
        }
        let mut events = Vec::new();
        let had_fills = !outcome.fills.is_empty();
        for (fill, realised) in outcome.fills.iter().zip(&outcome.realised) {
            if fill_closes(&outcome, fill) {
                self.periodic.record_trade(*realised);
                self.trade.record_trade(*realised);
                self.eod.record_trade(*realised);
            }
        }
        events.push(SessionEvent::Order {
            updated: outcome.updated,
            fills: outcome.fills,
        });
        if had_fills {
            self.trade.update(self.broker.position(), snapshot);
            if self.flags.trade_report {
                events.push(SessionEvent::Metrics(self.trade.report(
                    ReportKind::Trade,
                    self.broker.position(),
                    snapshot,
                    batch.timestamp,
                )));
            }
        }
        events
    }

    /// Phase 2 of a replay tick: refresh running stats and emit periodic
    /// or end-of-day reports.
    pub fn process_market_data(
        &mut self,
        batch: &ReplayBatch,
        snapshot: &PriceSnapshot,
        rep: TimeRep,
    ) -> Vec<SessionEvent> {
        self.event_counter += 1;
        self.periodic.update(self.broker.position(), snapshot);

        // On a rollover the previous day's report and reset must come
        // before this batch touches the EOD stats, so day N's report
        // never carries day N+1's opening observation.
        let mut events = Vec::new();
        let day = rep.day_index(batch.timestamp);
        match self.current_day {
            Some(previous) if day > previous => {
                if self.flags.eod_report {
                    events.push(SessionEvent::Metrics(self.eod.report(
                        ReportKind::EndOfDay,
                        self.broker.position(),
                        snapshot,
                        batch.timestamp,
                    )));
                }
                self.eod.reset(self.broker.position().market_value(snapshot));
                self.current_day = Some(day);
            }
            Some(_) => {}
            None => self.current_day = Some(day),
        }
        self.eod.update(self.broker.position(), snapshot);

        if self.flags.periodic_period > 0
            && self.event_counter % u64::from(self.flags.periodic_period) == 0
        {
            events.push(SessionEvent::Metrics(self.periodic.report(
                ReportKind::Periodic,
                self.broker.position(),
                snapshot,
                batch.timestamp,
            )));
        }
        events
    }
}

/// Whether a fill consumed lots (its order's effect was a close).
fn fill_closes(outcome: &tapesim_broker::MatchOutcome, fill: &Fill) -> bool {
    outcome
        .updated
        .iter()
        .find(|state| state.id() == fill.order_id)
        .map(|state| state.request.effect.is_close())
        .unwrap_or(false)
}

/// All live clients on one transport plus the connection-wide replay
/// state.
pub struct ConnectionSession {
    clients: IndexMap<Cid, ClientSession>,
    active_replay: Option<String>,
    time_rep: TimeRep,
}

impl ConnectionSession {
    #[must_use]
    pub fn new(time_rep: TimeRep) -> Self {
        Self {
            clients: IndexMap::new(),
            active_replay: None,
            time_rep,
        }
    }

    #[must_use]
    pub fn time_rep(&self) -> TimeRep {
        self.time_rep
    }

    pub fn set_time_rep(&mut self, rep: TimeRep) {
        self.time_rep = rep;
    }

    /// Create a client session. Logging in mid-replay is rejected;
    /// sessions must be prepared before the stream starts. A duplicate
    /// cid replaces the previous session.
    pub fn login(
        &mut self,
        cid: Cid,
        config: SimConfig,
        now: DateTime<Utc>,
    ) -> Result<&mut ClientSession, SessionError> {
        if self.active_replay.is_some() {
            return Err(SessionError::ReplayActive);
        }
        if self.clients.contains_key(&cid) {
            warn!(%cid, "cid already logged in; replacing session");
        }
        let session = ClientSession::new(cid.clone(), config, now);
        self.clients.insert(cid.clone(), session);
        Ok(self
            .clients
            .get_mut(&cid)
            .expect("session inserted just above"))
    }

    /// Destroy a client session.
    pub fn logout(&mut self, cid: &str) -> Result<(), SessionError> {
        self.clients
            .shift_remove(cid)
            .map(|_| ())
            .ok_or_else(|| SessionError::UnknownClient(cid.to_string()))
    }

    pub fn client_mut(&mut self, cid: &str) -> Result<&mut ClientSession, SessionError> {
        self.clients
            .get_mut(cid)
            .ok_or_else(|| SessionError::UnknownClient(cid.to_string()))
    }

    #[must_use]
    pub fn client(&self, cid: &str) -> Option<&ClientSession> {
        self.clients.get(cid)
    }

    /// Iterate clients in login order.
    pub fn clients_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.clients.values_mut()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn active_replay(&self) -> Option<&str> {
        self.active_replay.as_deref()
    }

    /// Mark a replay active and freeze every client's subscription set.
    pub fn begin_replay(&mut self, replay_id: &str) -> Result<(), SessionError> {
        if self.active_replay.is_some() {
            return Err(SessionError::ReplayAlreadyActive);
        }
        self.active_replay = Some(replay_id.to_string());
        for client in self.clients.values_mut() {
            client.begin_replay();
        }
        Ok(())
    }

    /// Clear the active-replay flag and thaw subscriptions.
    pub fn end_replay(&mut self) {
        self.active_replay = None;
        for client in self.clients.values_mut() {
            client.end_replay();
        }
    }

    /// Union of every client's subscriptions, used as the datasource
    /// symbol filter. Any wildcard collapses the filter to "everything".
    #[must_use]
    pub fn union_filter(&self) -> Vec<Symbol> {
        let mut union = BTreeSet::new();
        for client in self.clients.values() {
            if client.has_wildcard() {
                return Vec::new();
            }
            union.extend(client.subscriptions().iter().cloned());
        }
        union.into_iter().collect()
    }
}
