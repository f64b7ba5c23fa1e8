//! WebSocket replay server.
//!
//! One task per transport: a read loop parses request envelopes and
//! dispatches them serially, an unbounded outbound channel plus writer
//! task keeps frame ordering, and a long-running replay task interleaves
//! with concurrent handlers by releasing the session lock at every pacing
//! sleep. Transport close aborts the replay task and drops all
//! per-connection state.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use tapesim_core::TimeRep;
use tapesim_data::DataSource;
use tapesim_proto::Frame;
use tapesim_session::ConnectionSession;

mod metrics;
mod replay;
mod router;

pub use metrics::{spawn_metrics_server, ServerMetrics};

/// Server-level settings shared by every connection.
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    /// Table whose time representation is negotiated at `init`; defaults
    /// to the first advertised table.
    pub default_table: Option<String>,
    /// Fallback representation before `init` has run.
    pub default_rep: TimeRep,
}

/// A bound replay server accepting WebSocket transports.
pub struct ReplayServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ReplayServer {
    /// Bind and start accepting. `addr` may carry port 0 for tests.
    pub async fn bind(
        addr: &str,
        data: Arc<dyn DataSource>,
        config: ServerConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, peer)) => {
                                let data = data.clone();
                                let config = config.clone();
                                let metrics = metrics.clone();
                                tokio::spawn(async move {
                                    metrics.connection_opened();
                                    if let Err(err) =
                                        handle_socket(stream, peer, data, config, metrics.clone())
                                            .await
                                    {
                                        warn!(error = %err, "transport ended with error");
                                    }
                                    metrics.connection_closed();
                                });
                            }
                            Err(err) => {
                                warn!(error = %err, "failed to accept transport");
                                break;
                            }
                        }
                    }
                }
            }
        });
        info!(%addr, "replay server listening");
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Run until the accept loop exits (shutdown or listener error).
    pub async fn join(mut self) -> Result<()> {
        (&mut self.handle).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for ReplayServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

/// Shared per-connection state; the replay task and the handler loop both
/// hold an `Arc` of this.
pub(crate) struct ConnState {
    pub(crate) session: AsyncMutex<ConnectionSession>,
    pub(crate) data: Arc<dyn DataSource>,
    pub(crate) outbound: mpsc::UnboundedSender<Message>,
    pub(crate) metrics: Arc<ServerMetrics>,
    pub(crate) config: ServerConfig,
    replay_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnState {
    /// Serialize and enqueue one frame. Returns false once the transport
    /// writer is gone.
    pub(crate) fn send(&self, frame: &Frame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => {
                self.metrics.inc_frames_out();
                self.outbound.send(Message::Text(text)).is_ok()
            }
            Err(err) => {
                warn!(error = %err, "failed to serialize outbound frame");
                false
            }
        }
    }

    pub(crate) fn set_replay_task(&self, handle: JoinHandle<()>) {
        let mut slot = self.replay_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    fn abort_replay_task(&self) {
        let mut slot = self.replay_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

async fn handle_socket(
    stream: TcpStream,
    peer: SocketAddr,
    data: Arc<dyn DataSource>,
    config: ServerConfig,
    metrics: Arc<ServerMetrics>,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    debug!(%peer, "transport connected");
    let (mut sink, mut source) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let state = Arc::new(ConnState {
        session: AsyncMutex::new(ConnectionSession::new(config.default_rep)),
        data,
        outbound: tx,
        metrics,
        config,
        replay_task: StdMutex::new(None),
    });

    while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, "transport read failed");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                state.metrics.inc_frames_in();
                router::handle_frame(&state, &text).await;
            }
            Message::Binary(bytes) => {
                if let Ok(text) = String::from_utf8(bytes) {
                    state.metrics.inc_frames_in();
                    router::handle_frame(&state, &text).await;
                }
            }
            Message::Ping(payload) => {
                let _ = state.outbound.send(Message::Pong(payload));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Transport gone: cancel any in-flight replay and stop writing.
    state.abort_replay_task();
    writer.abort();
    debug!(%peer, "transport closed");
    Ok(())
}
