use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tapesim_core::{MarketRecord, Quote, TimeRep};
use tapesim_data::MemorySource;
use tapesim_server::{ReplayServer, ServerConfig, ServerMetrics};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_600_000_000 + seconds, 0).unwrap()
}

fn quote(symbol: &str, seconds: i64, price: f64) -> MarketRecord {
    MarketRecord::Quote(Quote {
        symbol: symbol.into(),
        timestamp: ts(seconds),
        price,
        bid: None,
        ask: None,
        volume: None,
    })
}

async fn spawn_server(records: Vec<MarketRecord>) -> ReplayServer {
    let source = MemorySource::new()
        .with_table("trades", TimeRep::default(), records)
        .unwrap();
    ReplayServer::bind(
        "127.0.0.1:0",
        Arc::new(source),
        ServerConfig::default(),
        Arc::new(ServerMetrics::new()),
    )
    .await
    .unwrap()
}

async fn connect(server: &ReplayServer) -> Socket {
    let (socket, _) = connect_async(server.base_url()).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .unwrap();
}

async fn recv(socket: &mut Socket) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// Read frames until the predicate matches, returning every frame seen
/// (the matching one last).
async fn recv_until(socket: &mut Socket, pred: impl Fn(&Value) -> bool) -> Vec<Value> {
    let mut seen = Vec::new();
    loop {
        let frame = recv(socket).await;
        let done = pred(&frame);
        seen.push(frame);
        if done {
            return seen;
        }
    }
}

fn is_result_for(frame: &Value, id: i64) -> bool {
    frame["type"] == "result" && frame["id"] == json!(id)
}

async fn login(socket: &mut Socket, id: i64, cid: &str) {
    send(
        socket,
        json!({"method": "login", "id": id, "cid": cid, "params": {"config": {"initialCash": 10000.0}}}),
    )
    .await;
    let frame = recv(socket).await;
    assert_eq!(frame["type"], "result", "login failed: {frame}");
    assert_eq!(frame["result"]["connected"], json!(true));
}

async fn subscribe_all(socket: &mut Socket, id: i64, cid: &str) {
    send(
        socket,
        json!({"method": "subscribe", "id": id, "cid": cid, "params": ["*"]}),
    )
    .await;
    let frame = recv(socket).await;
    assert_eq!(frame["result"], json!(["*"]));
}

fn replay_request(id: i64, replay_id: &str, interval_ms: u64, multiplex: bool) -> Value {
    json!({
        "method": "replay",
        "id": id,
        "params": {
            "table": "trades",
            "from": 0,
            "to": 4_000_000_000_000_i64,
            "replayInterval": interval_ms,
            "replayId": replay_id,
            "marketMultiplex": multiplex,
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn market_buy_fills_end_to_end() {
    let server = spawn_server(vec![quote("X", 1, 100.0), quote("X", 2, 101.0)]).await;
    let mut socket = connect(&server).await;

    send(&mut socket, json!({"method": "init", "id": 1, "params": {}})).await;
    let init = recv(&mut socket).await;
    assert_eq!(init["result"]["replayTables"][0]["name"], "trades");

    login(&mut socket, 2, "c1").await;
    subscribe_all(&mut socket, 3, "c1").await;

    send(
        &mut socket,
        json!({
            "method": "submitOrders", "id": 4, "cid": "c1",
            "params": [{
                "id": "o1", "symbol": "X", "side": "BUY", "effect": "OPEN_LONG",
                "type": "MARKET", "quantity": 10.0
            }]
        }),
    )
    .await;
    let submit = recv(&mut socket).await;
    assert_eq!(submit["result"], json!(1));
    let ack = recv(&mut socket).await;
    assert_eq!(ack["type"], "event");
    assert_eq!(ack["event"]["type"], "order");
    assert_eq!(ack["event"]["updated"][0]["status"], "OPEN");

    send(&mut socket, replay_request(5, "r1", 0, false)).await;
    let frames = recv_until(&mut socket, |f| is_result_for(f, 5)).await;

    // The fill precedes the market observation that caused it.
    let order_idx = frames
        .iter()
        .position(|f| f["event"]["type"] == "order")
        .expect("order event");
    let market_idx = frames
        .iter()
        .position(|f| f["event"]["type"] == "market")
        .expect("market event");
    assert!(order_idx < market_idx);

    let order = &frames[order_idx];
    assert_eq!(order["cid"], "c1");
    assert_eq!(order["event"]["updated"][0]["id"], "o1");
    assert_eq!(order["event"]["updated"][0]["status"], "FILLED");
    assert_eq!(order["event"]["updated"][0]["filledQuantity"], json!(10.0));
    let fill = &order["event"]["fill"][0];
    assert_eq!(fill["orderId"], "o1");
    assert_eq!(fill["price"], json!(100.0));
    assert_eq!(fill["quantity"], json!(10.0));
    assert_eq!(fill["commission"], json!(0.0));

    let done = frames.last().unwrap();
    assert_eq!(done["result"]["replayId"], "r1");
    assert!(done["result"]["begin"].is_i64());

    // Exactly one result for the replay request, nothing after it.
    assert_eq!(
        frames.iter().filter(|f| is_result_for(f, 5)).count(),
        1
    );

    send(
        &mut socket,
        json!({"method": "getPosition", "id": 6, "cid": "c1", "params": {}}),
    )
    .await;
    let position = recv(&mut socket).await;
    assert_eq!(position["result"]["cash"], json!(9000.0));
    assert_eq!(position["result"]["long"]["X"][0]["quantity"], json!(10.0));
    assert_eq!(position["result"]["long"]["X"][0]["price"], json!(100.0));

    drop(socket);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_during_replay_is_rejected() {
    let records = (0..5).map(|i| quote("X", i, 100.0 + i as f64)).collect();
    let server = spawn_server(records).await;
    let mut socket = connect(&server).await;

    send(&mut socket, json!({"method": "init", "id": 1, "params": {}})).await;
    recv(&mut socket).await;
    login(&mut socket, 2, "c1").await;
    subscribe_all(&mut socket, 3, "c1").await;

    // Slow replay so the follow-up login lands mid-stream.
    send(&mut socket, replay_request(4, "r1", 100, false)).await;
    send(
        &mut socket,
        json!({"method": "login", "id": 5, "cid": "c2", "params": {"config": {"initialCash": 1000.0}}}),
    )
    .await;
    // A second replay on the same transport is also refused.
    send(&mut socket, replay_request(6, "r2", 0, false)).await;

    let frames = recv_until(&mut socket, |f| is_result_for(f, 4)).await;
    let login_error = frames
        .iter()
        .find(|f| f["type"] == "error" && f["id"] == json!(5))
        .expect("login error frame");
    assert_eq!(login_error["error"]["code"], "REPLAY_ACTIVE");
    let replay_error = frames
        .iter()
        .find(|f| f["type"] == "error" && f["id"] == json!(6))
        .expect("second replay error frame");
    assert_eq!(replay_error["error"]["code"], "REPLAY_ALREADY_ACTIVE");

    // After completion the connection accepts logins again.
    login(&mut socket, 7, "c2").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multiplex_emits_single_market_event_per_batch() {
    let records = vec![
        quote("X", 1, 100.0),
        quote("Y", 1, 50.0),
        quote("X", 2, 101.0),
        quote("Y", 2, 51.0),
    ];
    let server = spawn_server(records).await;
    let mut socket = connect(&server).await;

    send(&mut socket, json!({"method": "init", "id": 1, "params": {}})).await;
    recv(&mut socket).await;
    login(&mut socket, 2, "a").await;
    subscribe_all(&mut socket, 3, "a").await;
    login(&mut socket, 4, "b").await;
    subscribe_all(&mut socket, 5, "b").await;

    send(&mut socket, replay_request(6, "mx", 0, true)).await;
    let frames = recv_until(&mut socket, |f| is_result_for(f, 6)).await;

    let market_frames: Vec<_> = frames
        .iter()
        .filter(|f| f["event"]["type"] == "market")
        .collect();
    assert_eq!(market_frames.len(), 2, "one market event per batch");
    for frame in &market_frames {
        assert_eq!(frame["cid"], "__multiplex__");
        assert_eq!(frame["event"]["data"].as_array().unwrap().len(), 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multiplex_runs_metrics_for_unmatched_subscribers() {
    let server = spawn_server(vec![quote("X", 1, 100.0), quote("X", 2, 101.0)]).await;
    let mut socket = connect(&server).await;

    send(&mut socket, json!({"method": "init", "id": 1, "params": {}})).await;
    recv(&mut socket).await;
    login(&mut socket, 2, "a").await;
    subscribe_all(&mut socket, 3, "a").await;
    login(&mut socket, 4, "b").await;
    // "b" watches a symbol the table never carries.
    send(
        &mut socket,
        json!({"method": "subscribe", "id": 5, "cid": "b", "params": ["ZZZ"]}),
    )
    .await;
    let frame = recv(&mut socket).await;
    assert_eq!(frame["result"], json!(["ZZZ"]));

    send(
        &mut socket,
        json!({
            "method": "replay", "id": 6,
            "params": {
                "table": "trades",
                "from": 0,
                "to": 4_000_000_000_000_i64,
                "replayId": "mx2",
                "marketMultiplex": true,
                "periodicReport": 1,
            }
        }),
    )
    .await;
    let frames = recv_until(&mut socket, |f| is_result_for(f, 6)).await;

    // Periodic metrics still reach the client whose filtered slice is
    // empty on every batch.
    let b_metrics = frames
        .iter()
        .filter(|f| f["event"]["type"] == "metrics" && f["cid"] == "b")
        .count();
    assert_eq!(b_metrics, 2);
    let b_periodic = frames
        .iter()
        .filter(|f| f["cid"] == "b")
        .all(|f| f["event"]["reportType"] == "PERIODIC");
    assert!(b_periodic);

    // Market events stay on the multiplex channel only.
    assert!(frames
        .iter()
        .filter(|f| f["event"]["type"] == "market")
        .all(|f| f["cid"] == "__multiplex__"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protocol_errors_are_answered_synchronously() {
    let server = spawn_server(vec![quote("X", 1, 100.0)]).await;
    let mut socket = connect(&server).await;

    send(
        &mut socket,
        json!({"method": "selfDestruct", "id": 1, "params": {}}),
    )
    .await;
    let frame = recv(&mut socket).await;
    assert_eq!(frame["error"]["code"], "INVALID_METHOD");
    assert_eq!(frame["id"], json!(1));

    // Client-scoped method without a cid.
    send(
        &mut socket,
        json!({"method": "getPosition", "id": 2, "params": {}}),
    )
    .await;
    let frame = recv(&mut socket).await;
    assert_eq!(frame["error"]["code"], "INVALID_CLIENT");

    // Unknown cid.
    send(
        &mut socket,
        json!({"method": "getPosition", "id": 3, "cid": "ghost", "params": {}}),
    )
    .await;
    let frame = recv(&mut socket).await;
    assert_eq!(frame["error"]["code"], "INVALID_CLIENT");

    // Unknown table.
    send(
        &mut socket,
        json!({
            "method": "replay", "id": 4,
            "params": {"table": "ghost", "from": 0, "to": 1, "replayId": "r"}
        }),
    )
    .await;
    let frame = recv(&mut socket).await;
    assert_eq!(frame["error"]["code"], "INVALID_TABLE");

    // Malformed envelope without a recoverable id.
    socket
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    let frame = recv(&mut socket).await;
    assert_eq!(frame["error"]["code"], "INVALID_PARAMS");
    assert!(frame.get("id").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_orders_surface_in_event_not_error() {
    let server = spawn_server(vec![quote("X", 1, 100.0)]).await;
    let mut socket = connect(&server).await;

    send(&mut socket, json!({"method": "init", "id": 1, "params": {}})).await;
    recv(&mut socket).await;
    login(&mut socket, 2, "c1").await;

    let order = json!({
        "id": "dup", "symbol": "X", "side": "BUY", "effect": "OPEN_LONG",
        "type": "MARKET", "quantity": 1.0
    });
    send(
        &mut socket,
        json!({"method": "submitOrders", "id": 3, "cid": "c1", "params": [order.clone(), order]}),
    )
    .await;
    let result = recv(&mut socket).await;
    assert_eq!(result["type"], "result");
    assert_eq!(result["result"], json!(1));
    let event = recv(&mut socket).await;
    assert_eq!(event["event"]["updated"][0]["status"], "OPEN");
    assert_eq!(event["event"]["updated"][1]["status"], "REJECTED");

    send(
        &mut socket,
        json!({"method": "getOpenOrders", "id": 4, "cid": "c1", "params": {}}),
    )
    .await;
    let open = recv(&mut socket).await;
    assert_eq!(open["result"].as_array().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriptions_are_frozen_mid_replay() {
    let records = (0..5).map(|i| quote("X", i, 100.0)).collect();
    let server = spawn_server(records).await;
    let mut socket = connect(&server).await;

    send(&mut socket, json!({"method": "init", "id": 1, "params": {}})).await;
    recv(&mut socket).await;
    login(&mut socket, 2, "c1").await;
    subscribe_all(&mut socket, 3, "c1").await;

    send(&mut socket, replay_request(4, "r1", 100, false)).await;
    send(
        &mut socket,
        json!({"method": "subscribe", "id": 5, "cid": "c1", "params": ["Y"]}),
    )
    .await;

    let frames = recv_until(&mut socket, |f| is_result_for(f, 4)).await;
    let sub_result = frames
        .iter()
        .find(|f| is_result_for(f, 5))
        .expect("subscribe result mid-replay");
    assert_eq!(sub_result["result"], json!([]));
}
