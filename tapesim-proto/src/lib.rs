//! JSON wire protocol shared by the server and client orchestrators.
//!
//! Requests arrive as `{method, id, cid?, params}` envelopes; everything
//! outbound is a `{type: result|error|event, ...}` frame. Timestamps on
//! the wire are always integers in the epoch representation negotiated at
//! `init` from the server's default table; the rendering helpers here do
//! that conversion in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use tapesim_core::{Cid, Fill, MarketRecord, OrderState, Position, TableInfo, TimeRep};
use tapesim_metrics::MetricsReport;

/// Sentinel cid used for multiplexed market events.
pub const MULTIPLEX_CID: &str = "__multiplex__";

/// Inbound request envelope.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Request {
    pub method: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<Cid>,
    #[serde(default)]
    pub params: Value,
}

/// The fixed method table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    Init,
    Login,
    Logout,
    Subscribe,
    Unsubscribe,
    GetPosition,
    GetOpenOrders,
    SubmitOrders,
    AmendOrders,
    CancelOrders,
    CancelAllOrders,
    Replay,
}

impl Method {
    /// Resolve a wire method name; `None` means `INVALID_METHOD`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "init" => Self::Init,
            "login" => Self::Login,
            "logout" => Self::Logout,
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "getPosition" => Self::GetPosition,
            "getOpenOrders" => Self::GetOpenOrders,
            "submitOrders" => Self::SubmitOrders,
            "amendOrders" => Self::AmendOrders,
            "cancelOrders" => Self::CancelOrders,
            "cancelAllOrders" => Self::CancelAllOrders,
            "replay" => Self::Replay,
            _ => return None,
        })
    }

    /// Client-scoped methods require a `cid` naming a live session.
    #[must_use]
    pub fn is_client_scoped(self) -> bool {
        !matches!(self, Self::Init | Self::Replay)
    }
}

/// Wire error codes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMethod,
    InvalidParams,
    InvalidClient,
    InvalidTable,
    NoReplayTable,
    ReplayActive,
    ReplayAlreadyActive,
    DataSourceError,
    ReplayError,
    InternalError,
}

/// Structured error carried inside an error frame.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Outbound frame: exactly one of `result`, `error` or `event` is set.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<Cid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Result,
    Error,
    Event,
}

impl Frame {
    #[must_use]
    pub fn result(id: i64, cid: Option<Cid>, result: Value) -> Self {
        Self {
            kind: FrameKind::Result,
            id: Some(id),
            cid,
            result: Some(result),
            error: None,
            event: None,
        }
    }

    #[must_use]
    pub fn error(id: Option<i64>, cid: Option<Cid>, error: ApiError) -> Self {
        Self {
            kind: FrameKind::Error,
            id,
            cid,
            result: None,
            error: Some(error),
            event: None,
        }
    }

    #[must_use]
    pub fn event(cid: impl Into<Cid>, event: Value) -> Self {
        Self {
            kind: FrameKind::Event,
            id: None,
            cid: Some(cid.into()),
            result: None,
            error: None,
            event: Some(event),
        }
    }
}

/// `login` params.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginParams {
    #[serde(default)]
    pub config: tapesim_core::SimConfig,
}

/// `replay` params; `from`/`to` are raw epochs in the connection's
/// representation.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayParams {
    pub table: String,
    pub from: i64,
    pub to: i64,
    #[serde(default)]
    pub replay_interval: u64,
    pub replay_id: String,
    #[serde(default)]
    pub periodic_report: Option<u32>,
    #[serde(default)]
    pub trade_report: Option<bool>,
    #[serde(default)]
    pub end_of_day_report: Option<bool>,
    #[serde(default)]
    pub market_multiplex: bool,
}

/// Replace a RFC3339 time field with its raw epoch rendering.
fn patch_epoch(mut value: Value, field: &str, ts: DateTime<Utc>, rep: TimeRep) -> Value {
    value[field] = json!(rep.to_epoch(ts));
    value
}

/// `TableInfo` as advertised by `init`.
#[must_use]
pub fn table_info_value(info: &TableInfo, rep: TimeRep) -> Value {
    let value = json!({ "name": info.name });
    let value = patch_epoch(value, "startTime", info.start_time, rep);
    patch_epoch(value, "endTime", info.end_time, rep)
}

/// One market record with its timestamp rendered as a raw epoch.
#[must_use]
pub fn record_value(record: &MarketRecord, rep: TimeRep) -> Value {
    let value = serde_json::to_value(record).unwrap_or(Value::Null);
    patch_epoch(value, "timestamp", record.timestamp(), rep)
}

#[must_use]
pub fn order_state_value(state: &OrderState, rep: TimeRep) -> Value {
    let value = serde_json::to_value(state).unwrap_or(Value::Null);
    patch_epoch(value, "modified", state.modified, rep)
}

#[must_use]
pub fn fill_value(fill: &Fill, rep: TimeRep) -> Value {
    let value = serde_json::to_value(fill).unwrap_or(Value::Null);
    patch_epoch(value, "created", fill.created, rep)
}

#[must_use]
pub fn position_value(position: &Position, rep: TimeRep) -> Value {
    let value = serde_json::to_value(position).unwrap_or(Value::Null);
    patch_epoch(value, "modified", position.modified, rep)
}

#[must_use]
pub fn report_value(report: &MetricsReport, rep: TimeRep) -> Value {
    let value = serde_json::to_value(report).unwrap_or(Value::Null);
    patch_epoch(value, "timestamp", report.timestamp, rep)
}

/// `market` event payload.
#[must_use]
pub fn market_event(records: &[MarketRecord], rep: TimeRep) -> Value {
    json!({
        "type": "market",
        "data": records.iter().map(|r| record_value(r, rep)).collect::<Vec<_>>(),
    })
}

/// `order` event payload.
#[must_use]
pub fn order_event(updated: &[OrderState], fills: &[Fill], rep: TimeRep) -> Value {
    json!({
        "type": "order",
        "updated": updated.iter().map(|s| order_state_value(s, rep)).collect::<Vec<_>>(),
        "fill": fills.iter().map(|f| fill_value(f, rep)).collect::<Vec<_>>(),
    })
}

/// `external` event payload: an arbitrary passthrough for out-of-band
/// data a deployment wants to push alongside the replay.
#[must_use]
pub fn external_event(payload: Value) -> Value {
    json!({
        "type": "external",
        "payload": payload,
    })
}

/// `metrics` event payload.
#[must_use]
pub fn metrics_event(report: &MetricsReport, rep: TimeRep) -> Value {
    let mut value = json!({ "type": "metrics" });
    if let Value::Object(body) = report_value(report, rep) {
        if let Value::Object(target) = &mut value {
            target.extend(body);
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tapesim_core::{OrderEffect, OrderRequest, OrderType, Quote, Side};

    fn rep() -> TimeRep {
        TimeRep::default()
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn request_envelope_decodes_optional_cid() {
        let request: Request = serde_json::from_str(
            r#"{"method":"init","id":1,"params":{}}"#,
        )
        .unwrap();
        assert_eq!(request.method, "init");
        assert!(request.cid.is_none());

        let request: Request = serde_json::from_str(
            r#"{"method":"subscribe","id":2,"cid":"c1","params":["X","*"]}"#,
        )
        .unwrap();
        assert_eq!(request.cid.as_deref(), Some("c1"));
    }

    #[test]
    fn method_table_is_exhaustive() {
        for name in [
            "init",
            "login",
            "logout",
            "subscribe",
            "unsubscribe",
            "getPosition",
            "getOpenOrders",
            "submitOrders",
            "amendOrders",
            "cancelOrders",
            "cancelAllOrders",
            "replay",
        ] {
            assert!(Method::parse(name).is_some(), "unknown method {name}");
        }
        assert!(Method::parse("selfDestruct").is_none());
        assert!(!Method::parse("replay").unwrap().is_client_scoped());
        assert!(Method::parse("login").unwrap().is_client_scoped());
    }

    #[test]
    fn error_codes_use_wire_names() {
        assert_eq!(
            serde_json::to_value(ErrorCode::ReplayAlreadyActive).unwrap(),
            json!("REPLAY_ALREADY_ACTIVE")
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::NoReplayTable).unwrap(),
            json!("NO_REPLAY_TABLE")
        );
    }

    #[test]
    fn frames_serialize_minimal_shapes() {
        let frame = Frame::result(7, None, json!({"ok": true}));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "result", "id": 7, "result": {"ok": true}})
        );

        let frame = Frame::error(
            None,
            None,
            ApiError::new(ErrorCode::InvalidParams, "bad envelope"),
        );
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "error", "error": {"code": "INVALID_PARAMS", "message": "bad envelope"}})
        );

        let frame = Frame::event("c1", json!({"type": "external", "payload": 1}));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["cid"], "c1");
    }

    #[test]
    fn record_value_renders_epoch_timestamp() {
        let record = MarketRecord::Quote(Quote {
            symbol: "X".into(),
            timestamp: ts(),
            price: 100.0,
            bid: None,
            ask: None,
            volume: None,
        });
        let value = record_value(&record, rep());
        assert_eq!(value["timestamp"], json!(ts().timestamp_millis()));
        assert_eq!(value["price"], json!(100.0));
        assert!(value.get("open").is_none());
    }

    #[test]
    fn order_event_carries_updated_and_fill_arrays() {
        let state = OrderState::open(
            OrderRequest {
                id: "o1".into(),
                symbol: "X".into(),
                side: Side::Buy,
                effect: OrderEffect::OpenLong,
                order_type: OrderType::Market,
                quantity: 1.0,
                price: None,
                stop_price: None,
            },
            ts(),
        );
        let event = order_event(&[state], &[], rep());
        assert_eq!(event["type"], "order");
        assert_eq!(event["updated"][0]["id"], "o1");
        assert_eq!(event["updated"][0]["status"], "OPEN");
        assert_eq!(event["updated"][0]["type"], "MARKET");
        assert_eq!(event["updated"][0]["modified"], json!(ts().timestamp_millis()));
        assert_eq!(event["fill"], json!([]));
    }

    #[test]
    fn external_event_wraps_payload() {
        let event = external_event(json!({"note": "halt", "severity": 2}));
        assert_eq!(event["type"], "external");
        assert_eq!(event["payload"]["severity"], 2);
    }

    #[test]
    fn replay_params_decode_defaults() {
        let params: ReplayParams = serde_json::from_value(json!({
            "table": "trades",
            "from": 0,
            "to": 100,
            "replayId": "r1"
        }))
        .unwrap();
        assert_eq!(params.replay_interval, 0);
        assert!(!params.market_multiplex);
        assert!(params.periodic_report.is_none());
    }
}
