//! Replay orchestrator: drives one datasource stream, advances the shared
//! clock, fans batches out to every client and paces emission.
//!
//! The orchestrator holds the session lock only while a batch is being
//! processed; the pacing sleep happens unlocked so concurrent handlers on
//! the same transport interleave at every batch boundary, which is also
//! where transport cancellation takes effect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use tapesim_core::{PriceSnapshot, ReplayBatch, Symbol, TimeRep};
use tapesim_proto::{
    market_event, metrics_event, order_event, ApiError, ErrorCode, Frame, ReplayParams, Request,
    MULTIPLEX_CID,
};
use tapesim_session::{ReportingFlags, SessionEvent};

use crate::ConnState;

/// Validate a `replay` request and launch the streaming task. Precondition
/// failures answer synchronously; the final result frame is emitted by the
/// task itself.
pub(crate) async fn start(state: &Arc<ConnState>, request: Request) {
    let params: ReplayParams = match serde_json::from_value(request.params.clone()) {
        Ok(params) => params,
        Err(err) => {
            state.send(&Frame::error(
                Some(request.id),
                None,
                ApiError::new(ErrorCode::InvalidParams, format!("bad replay params: {err}")),
            ));
            return;
        }
    };

    let (from, to, filter) = {
        let mut session = state.session.lock().await;
        if session.active_replay().is_some() {
            drop(session);
            state.send(&Frame::error(
                Some(request.id),
                None,
                ApiError::new(
                    ErrorCode::ReplayAlreadyActive,
                    "a replay is already active on this connection",
                ),
            ));
            return;
        }
        let tables = match state.data.tables().await {
            Ok(tables) => tables,
            Err(err) => {
                drop(session);
                state.send(&Frame::error(
                    Some(request.id),
                    None,
                    ApiError::new(ErrorCode::DataSourceError, err.to_string()),
                ));
                return;
            }
        };
        if !tables.iter().any(|table| table.name == params.table) {
            drop(session);
            state.send(&Frame::error(
                Some(request.id),
                None,
                ApiError::new(
                    ErrorCode::InvalidTable,
                    format!("table '{}' is not replayable", params.table),
                ),
            ));
            return;
        }
        let rep = session.time_rep();
        let (Some(from), Some(to)) = (rep.from_epoch(params.from), rep.from_epoch(params.to))
        else {
            drop(session);
            state.send(&Frame::error(
                Some(request.id),
                None,
                ApiError::new(ErrorCode::InvalidParams, "from/to out of epoch range"),
            ));
            return;
        };

        let flags = ReportingFlags {
            periodic_period: params.periodic_report.unwrap_or(0),
            trade_report: params.trade_report.unwrap_or(false),
            eod_report: params.end_of_day_report.unwrap_or(false),
        };
        for client in session.clients_mut() {
            client.set_flags(flags);
        }
        let filter = session.union_filter();
        if let Err(err) = session.begin_replay(&params.replay_id) {
            drop(session);
            state.send(&Frame::error(
                Some(request.id),
                None,
                crate::router::session_error(err),
            ));
            return;
        }
        (from, to, filter)
    };

    state.metrics.inc_replays();
    info!(
        table = %params.table,
        replay_id = %params.replay_id,
        filter_symbols = filter.len(),
        "replay started"
    );

    let task_state = state.clone();
    let request_id = request.id;
    let begin = Utc::now();
    let handle = tokio::spawn(async move {
        run(task_state, request_id, params, from, to, filter, begin).await;
    });
    state.set_replay_task(handle);
}

async fn run(
    state: Arc<ConnState>,
    request_id: i64,
    params: ReplayParams,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    filter: Vec<Symbol>,
    begin: DateTime<Utc>,
) {
    let outcome = stream(&state, &params, from, to, &filter).await;

    // Always clear the flag, success or error, before answering.
    let rep = {
        let mut session = state.session.lock().await;
        session.end_replay();
        session.time_rep()
    };

    match outcome {
        Ok(batches) => {
            debug!(replay_id = %params.replay_id, batches, "replay finished");
            state.send(&Frame::result(
                request_id,
                None,
                json!({
                    "replayId": params.replay_id,
                    "begin": rep.to_epoch(begin),
                    "end": rep.to_epoch(Utc::now()),
                }),
            ));
        }
        Err(error) => {
            warn!(replay_id = %params.replay_id, %error, "replay truncated");
            state.send(&Frame::error(Some(request_id), None, error));
        }
    }
}

async fn stream(
    state: &Arc<ConnState>,
    params: &ReplayParams,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    filter: &[Symbol],
) -> Result<u64, ApiError> {
    let mut stream = state
        .data
        .open(&params.table, from, to, filter)
        .await
        .map_err(|err| ApiError::new(ErrorCode::DataSourceError, err.to_string()))?;

    let mut snapshot = PriceSnapshot::default();
    let mut batches = 0u64;
    loop {
        let next = stream
            .next_batch()
            .await
            .map_err(|err| ApiError::new(ErrorCode::ReplayError, err.to_string()))?;
        let Some(batch) = next else {
            break;
        };
        batches += 1;
        state.metrics.inc_batches();
        process_batch(state, params, &mut snapshot, &batch).await;

        // Sole pacing mechanism; also the suspension point where other
        // handlers and transport cancellation get their turn.
        if params.replay_interval > 0 {
            sleep(Duration::from_millis(params.replay_interval)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
    Ok(batches)
}

async fn process_batch(
    state: &Arc<ConnState>,
    params: &ReplayParams,
    snapshot: &mut PriceSnapshot,
    batch: &ReplayBatch,
) {
    let mut frames = Vec::new();
    {
        let mut session = state.session.lock().await;
        let rep = session.time_rep();
        snapshot.observe(batch);
        for client in session.clients_mut() {
            client.advance_clock(batch.timestamp);
        }

        // Phase 1: orders for every client, before any market data goes
        // out. A fill at time T is therefore always emitted before the
        // observation that caused it.
        for client in session.clients_mut() {
            if !client.broker().touches(batch) {
                continue;
            }
            let cid = client.cid().to_string();
            for event in client.process_order_update(batch, snapshot) {
                frames.push(event_frame(state, &cid, event, rep));
            }
        }

        // Phase 2: market data and metrics.
        if params.market_multiplex {
            // Every client still runs its metrics pass, even when its
            // filtered slice is empty; only the market event is shared.
            for client in session.clients_mut() {
                let cid = client.cid().to_string();
                let sub_batch = ReplayBatch {
                    timestamp: batch.timestamp,
                    data: client.subscribed_slice(batch),
                };
                for event in client.process_market_data(&sub_batch, snapshot, rep) {
                    frames.push(event_frame(state, &cid, event, rep));
                }
            }
            frames.push(Frame::event(MULTIPLEX_CID, market_event(&batch.data, rep)));
        } else {
            for client in session.clients_mut() {
                let slice = client.subscribed_slice(batch);
                if slice.is_empty() {
                    continue;
                }
                let cid = client.cid().to_string();
                let sub_batch = ReplayBatch {
                    timestamp: batch.timestamp,
                    data: slice,
                };
                for event in client.process_market_data(&sub_batch, snapshot, rep) {
                    frames.push(event_frame(state, &cid, event, rep));
                }
                frames.push(Frame::event(cid, market_event(&sub_batch.data, rep)));
            }
        }
    }

    for frame in &frames {
        if !state.send(frame) {
            // Writer gone; the transport loop will abort us shortly.
            break;
        }
    }
}

fn event_frame(state: &Arc<ConnState>, cid: &str, event: SessionEvent, rep: TimeRep) -> Frame {
    match event {
        SessionEvent::Order { updated, fills } => {
            state.metrics.inc_fills(fills.len());
            Frame::event(cid, order_event(&updated, &fills, rep))
        }
        SessionEvent::Metrics(report) => Frame::event(cid, metrics_event(&report, rep)),
    }
}
