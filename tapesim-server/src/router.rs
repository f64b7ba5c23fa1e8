//! Request router: envelope parsing, method resolution, cid scoping and
//! the thin per-method handlers.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use tapesim_core::{OrderAmend, OrderRequest, OrderStatus, Symbol};
use tapesim_proto::{
    order_event, order_state_value, position_value, table_info_value, ApiError, ErrorCode, Frame,
    LoginParams, Method, Request,
};
use tapesim_session::{ConnectionSession, SessionError};

use crate::{replay, ConnState};

pub(crate) fn session_error(err: SessionError) -> ApiError {
    match err {
        SessionError::ReplayActive => ApiError::new(ErrorCode::ReplayActive, err.to_string()),
        SessionError::ReplayAlreadyActive => {
            ApiError::new(ErrorCode::ReplayAlreadyActive, err.to_string())
        }
        SessionError::UnknownClient(_) => ApiError::new(ErrorCode::InvalidClient, err.to_string()),
    }
}

fn invalid_params(detail: impl std::fmt::Display) -> ApiError {
    ApiError::new(ErrorCode::InvalidParams, detail.to_string())
}

/// Parse one inbound text frame and dispatch it. All protocol errors are
/// answered here; nothing escapes to the transport loop.
pub(crate) async fn handle_frame(state: &Arc<ConnState>, text: &str) {
    let request: Request = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(err) => {
            // Salvage the request id when the envelope is readable JSON.
            let id = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|value| value.get("id").and_then(Value::as_i64));
            state.send(&Frame::error(
                id,
                None,
                invalid_params(format!("malformed request envelope: {err}")),
            ));
            return;
        }
    };

    let Some(method) = Method::parse(&request.method) else {
        state.send(&Frame::error(
            Some(request.id),
            request.cid.clone(),
            ApiError::new(
                ErrorCode::InvalidMethod,
                format!("unknown method '{}'", request.method),
            ),
        ));
        return;
    };

    if method.is_client_scoped() && request.cid.is_none() {
        state.send(&Frame::error(
            Some(request.id),
            None,
            ApiError::new(
                ErrorCode::InvalidClient,
                format!("method '{}' requires a cid", request.method),
            ),
        ));
        return;
    }

    debug!(method = %request.method, id = request.id, cid = ?request.cid, "dispatching request");

    if method == Method::Replay {
        replay::start(state, request).await;
        return;
    }

    let (result, events) = {
        let mut session = state.session.lock().await;
        match dispatch(state, &mut session, method, &request).await {
            Ok(output) => output,
            Err(error) => {
                drop(session);
                state.send(&Frame::error(Some(request.id), request.cid.clone(), error));
                return;
            }
        }
    };

    state.send(&Frame::result(request.id, request.cid.clone(), result));
    for event in events {
        state.send(&event);
    }
}

/// Run one handler; returns the result payload plus any follow-up event
/// frames.
async fn dispatch(
    state: &Arc<ConnState>,
    session: &mut ConnectionSession,
    method: Method,
    request: &Request,
) -> Result<(Value, Vec<Frame>), ApiError> {
    let rep = session.time_rep();
    match method {
        Method::Init => {
            let tables = state
                .data
                .tables()
                .await
                .map_err(|err| ApiError::new(ErrorCode::DataSourceError, err.to_string()))?;
            let default = state
                .config
                .default_table
                .clone()
                .or_else(|| tables.first().map(|t| t.name.clone()))
                .ok_or_else(|| {
                    ApiError::new(ErrorCode::NoReplayTable, "no replayable tables available")
                })?;
            session.set_time_rep(state.data.time_rep(&default));
            let rep = session.time_rep();
            let rendered: Vec<Value> = tables
                .iter()
                .map(|info| table_info_value(info, rep))
                .collect();
            Ok((json!({ "replayTables": rendered }), Vec::new()))
        }
        Method::Login => {
            let cid = required_cid(request)?;
            let params: LoginParams =
                serde_json::from_value(request.params.clone()).map_err(invalid_params)?;
            params.config.validate().map_err(invalid_params)?;
            session
                .login(cid, params.config, Utc::now())
                .map_err(session_error)?;
            Ok((
                json!({ "connected": true, "timestamp": rep.to_epoch(Utc::now()) }),
                Vec::new(),
            ))
        }
        Method::Logout => {
            let cid = required_cid(request)?;
            session.logout(&cid).map_err(session_error)?;
            Ok((
                json!({ "connected": false, "timestamp": rep.to_epoch(Utc::now()) }),
                Vec::new(),
            ))
        }
        Method::Subscribe => {
            let cid = required_cid(request)?;
            let symbols: Vec<Symbol> =
                serde_json::from_value(request.params.clone()).map_err(invalid_params)?;
            let added = session
                .client_mut(&cid)
                .map_err(session_error)?
                .add_subscriptions(symbols);
            Ok((json!(added), Vec::new()))
        }
        Method::Unsubscribe => {
            let cid = required_cid(request)?;
            let symbols: Vec<Symbol> =
                serde_json::from_value(request.params.clone()).map_err(invalid_params)?;
            let removed = session
                .client_mut(&cid)
                .map_err(session_error)?
                .remove_subscriptions(&symbols);
            Ok((json!(removed), Vec::new()))
        }
        Method::GetPosition => {
            let cid = required_cid(request)?;
            let client = session.client_mut(&cid).map_err(session_error)?;
            Ok((position_value(client.broker().position(), rep), Vec::new()))
        }
        Method::GetOpenOrders => {
            let cid = required_cid(request)?;
            let client = session.client_mut(&cid).map_err(session_error)?;
            let orders: Vec<Value> = client
                .broker()
                .open_orders()
                .iter()
                .map(|state| order_state_value(state, rep))
                .collect();
            Ok((json!(orders), Vec::new()))
        }
        Method::SubmitOrders => {
            let cid = required_cid(request)?;
            let orders: Vec<OrderRequest> =
                serde_json::from_value(request.params.clone()).map_err(invalid_params)?;
            let client = session.client_mut(&cid).map_err(session_error)?;
            let states = client.broker_mut().submit(orders);
            let accepted = states
                .iter()
                .filter(|state| state.status != OrderStatus::Rejected)
                .count();
            state.metrics.inc_orders(accepted);
            let event = Frame::event(cid, order_event(&states, &[], rep));
            Ok((json!(accepted), vec![event]))
        }
        Method::AmendOrders => {
            let cid = required_cid(request)?;
            let amendments: Vec<OrderAmend> =
                serde_json::from_value(request.params.clone()).map_err(invalid_params)?;
            let client = session.client_mut(&cid).map_err(session_error)?;
            let states = client.broker_mut().amend(&amendments);
            let matched = states.len();
            let event = Frame::event(cid, order_event(&states, &[], rep));
            Ok((json!(matched), vec![event]))
        }
        Method::CancelOrders => {
            let cid = required_cid(request)?;
            let ids: Vec<String> =
                serde_json::from_value(request.params.clone()).map_err(invalid_params)?;
            let client = session.client_mut(&cid).map_err(session_error)?;
            let states = client.broker_mut().cancel(&ids);
            let cancelled = states.len();
            let event = Frame::event(cid, order_event(&states, &[], rep));
            Ok((json!(cancelled), vec![event]))
        }
        Method::CancelAllOrders => {
            let cid = required_cid(request)?;
            let client = session.client_mut(&cid).map_err(session_error)?;
            let states = client.broker_mut().cancel_all();
            let cancelled = states.len();
            let event = Frame::event(cid, order_event(&states, &[], rep));
            Ok((json!(cancelled), vec![event]))
        }
        Method::Replay => unreachable!("replay is dispatched separately"),
    }
}

fn required_cid(request: &Request) -> Result<String, ApiError> {
    request
        .cid
        .clone()
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidClient, "missing cid"))
}
