//! Prometheus counters for the replay server, exposed over a small HTTP
//! endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::body::Body;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Request, Response, StatusCode};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::{error, info};

/// Server-wide telemetry.
pub struct ServerMetrics {
    registry: Registry,
    connections_total: IntCounter,
    active_connections: IntGauge,
    frames_in: IntCounter,
    frames_out: IntCounter,
    replays_total: IntCounter,
    replay_batches: IntCounter,
    orders_total: IntCounter,
    fills_total: IntCounter,
}

impl ServerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let connections_total =
            IntCounter::new("tapesim_connections_total", "Accepted transports").unwrap();
        let active_connections =
            IntGauge::new("tapesim_active_connections", "Currently open transports").unwrap();
        let frames_in =
            IntCounter::new("tapesim_frames_in_total", "Inbound text frames").unwrap();
        let frames_out =
            IntCounter::new("tapesim_frames_out_total", "Outbound text frames").unwrap();
        let replays_total =
            IntCounter::new("tapesim_replays_total", "Replay requests accepted").unwrap();
        let replay_batches =
            IntCounter::new("tapesim_replay_batches_total", "Batches streamed").unwrap();
        let orders_total =
            IntCounter::new("tapesim_orders_total", "Orders accepted by brokers").unwrap();
        let fills_total =
            IntCounter::new("tapesim_fills_total", "Fills produced by matching").unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(active_connections.clone()))
            .unwrap();
        registry.register(Box::new(frames_in.clone())).unwrap();
        registry.register(Box::new(frames_out.clone())).unwrap();
        registry.register(Box::new(replays_total.clone())).unwrap();
        registry
            .register(Box::new(replay_batches.clone()))
            .unwrap();
        registry.register(Box::new(orders_total.clone())).unwrap();
        registry.register(Box::new(fills_total.clone())).unwrap();

        Self {
            registry,
            connections_total,
            active_connections,
            frames_in,
            frames_out,
            replays_total,
            replay_batches,
            orders_total,
            fills_total,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    pub fn inc_frames_in(&self) {
        self.frames_in.inc();
    }

    pub fn inc_frames_out(&self) {
        self.frames_out.inc();
    }

    pub fn inc_replays(&self) {
        self.replays_total.inc();
    }

    pub fn inc_batches(&self) {
        self.replay_batches.inc();
    }

    pub fn inc_orders(&self, count: usize) {
        self.orders_total.inc_by(count as u64);
    }

    pub fn inc_fills(&self, count: usize) {
        self.fills_total.inc_by(count as u64);
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Launch a lightweight HTTP server that exposes Prometheus metrics.
pub fn spawn_metrics_server(registry: Registry, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                            error!(error = %err, "failed to encode Prometheus metrics");
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                                    .body(Body::from("failed to encode metrics"))
                                    .unwrap(),
                            );
                        }
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", encoder.format_type())
                                .body(Body::from(buffer))
                                .unwrap(),
                        )
                    }
                }))
            }
        });

        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "metrics server terminated");
        } else {
            info!(%addr, "metrics server shutdown");
        }
    })
}
