//! Tunnel relay — accepts worker registrations and routes terminal streams.
//!
//! The relay listens on the router's RPC listener at `/rpc/worker`:
//! 1. The first frame of every connection is `worker.register`; it becomes a
//!    connect notification to the [`WorkerRegistry`].
//! 2. An accepted worker gets one live connection slot keyed by process name.
//!    Browser sessions open PTYs through that slot and receive output on a
//!    per-session channel.
//! 3. When the connection ends (close, error, missed heartbeats) the slot is
//!    released, open sessions are told the worker is gone, and the registry
//!    receives a disconnect notification. A connection that was already
//!    replaced by a newer one for the same name reports nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{ControlMessage, RejectCode, StreamFrame, StreamKind, TunnelMessage};
use crate::registry::{ConnectRequest, RegistryError, WorkerRegistry};

/// Messages queued towards one worker.
const WORKER_QUEUE: usize = 256;

/// Output chunks buffered per browser session before it is considered stuck.
const SESSION_QUEUE: usize = 256;

/// How long a fresh connection may take to send `worker.register`.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// What a browser session hears from the worker hosting its PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Raw PTY output.
    Output(Vec<u8>),
    /// The worker reports the session ended.
    Closed(String),
    /// The worker connection went away.
    Lost,
}

type SessionMap = Arc<RwLock<HashMap<String, mpsc::Sender<SessionSignal>>>>;

/// State shared across all relay handlers.
#[derive(Clone)]
pub struct RelayState {
    /// Live worker connections keyed by process name.
    pub workers: Arc<RwLock<HashMap<String, ConnectedWorker>>>,
    pub registry: WorkerRegistry,
    /// Shared secret for worker connections; `None` accepts any worker.
    pub worker_key: Option<String>,
    /// Seconds before a worker is evicted for missed heartbeats.
    pub heartbeat_timeout_secs: u64,
    /// Process epoch for lock-free heartbeat timestamps.
    pub epoch: Instant,
    next_conn_id: Arc<AtomicU64>,
}

/// A worker connected to the relay via its outbound WS tunnel.
pub struct ConnectedWorker {
    /// Distinguishes successive connections for the same name.
    pub conn_id: u64,
    /// Send messages to the worker over the tunnel WS.
    pub worker_tx: mpsc::Sender<TunnelMessage>,
    /// Open browser sessions hosted by this worker, keyed by session id.
    pub sessions: SessionMap,
    /// Last heartbeat timestamp as ms since relay epoch (lock-free).
    pub last_heartbeat_ms: Arc<AtomicU64>,
    pub connected_since: Instant,
    /// Tells the connection handler to hang up (replaced or evicted).
    pub shutdown_tx: watch::Sender<bool>,
}

/// Tell every open session on `worker` that it is gone and forget them.
async fn drain_worker(name: &str, worker: &ConnectedWorker, reason: &str) {
    let mut sessions = worker.sessions.write().await;
    let count = sessions.len();
    for (_, session_tx) in sessions.drain() {
        // A full queue still ends the session once the sender is dropped.
        let _ = session_tx.try_send(SessionSignal::Lost);
    }
    if count > 0 {
        info!(worker = %name, count, "Dropped {count} terminal sessions: {reason}");
    }
}

impl RelayState {
    pub fn new(
        registry: WorkerRegistry,
        worker_key: Option<String>,
        heartbeat_timeout_secs: u64,
    ) -> Self {
        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            registry,
            worker_key: worker_key.filter(|k| !k.is_empty()),
            heartbeat_timeout_secs,
            epoch: Instant::now(),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Evict workers whose heartbeat is older than `heartbeat_timeout_secs`
    /// and report them disconnected. Returns the evicted names.
    pub async fn sweep_dead_workers(&self) -> Vec<String> {
        let timeout_ms = self.heartbeat_timeout_secs * 1000;
        let now_ms = self.now_ms();

        let mut workers = self.workers.write().await;
        let dead: Vec<String> = workers
            .iter()
            .filter(|(_, w)| {
                now_ms.saturating_sub(w.last_heartbeat_ms.load(Ordering::Relaxed)) > timeout_ms
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &dead {
            if let Some(worker) = workers.remove(name) {
                let _ = worker.shutdown_tx.send(true);
                drain_worker(name, &worker, "heartbeat timeout").await;
                warn!(worker = %name, "Evicted worker (heartbeat timeout)");
            }
            // Still under the slot lock; see `release_slot`.
            self.registry.disconnect(name).await;
        }
        dead
    }

    /// Tell every worker the router is going away so it reconnects promptly.
    pub async fn broadcast_shutdown(&self) {
        let senders: Vec<(String, mpsc::Sender<TunnelMessage>)> = self
            .workers
            .read()
            .await
            .iter()
            .map(|(name, w)| (name.clone(), w.worker_tx.clone()))
            .collect();
        for (name, tx) in senders {
            if tx
                .send(TunnelMessage::Control(ControlMessage::RouterShutdown))
                .await
                .is_err()
            {
                debug!(worker = %name, "Worker gone before shutdown notice");
            }
        }
    }

    /// End every open session (used during router shutdown).
    pub async fn drain_all(&self) {
        let workers = self.workers.read().await;
        for (name, worker) in workers.iter() {
            drain_worker(name, worker, "router shutting down").await;
        }
    }

    async fn connection(&self, worker: &str) -> Option<(mpsc::Sender<TunnelMessage>, SessionMap)> {
        let workers = self.workers.read().await;
        workers
            .get(worker)
            .map(|w| (w.worker_tx.clone(), Arc::clone(&w.sessions)))
    }

    /// Ask `worker` to start a PTY for `session_id`. Returns the session's
    /// signal stream, or `None` when the worker has no live connection.
    pub async fn open_session(
        &self,
        worker: &str,
        session_id: &str,
    ) -> Option<mpsc::Receiver<SessionSignal>> {
        let (worker_tx, sessions) = self.connection(worker).await?;
        let (session_tx, session_rx) = mpsc::channel(SESSION_QUEUE);
        sessions
            .write()
            .await
            .insert(session_id.to_string(), session_tx);

        let open = ControlMessage::TerminalOpen {
            session_id: session_id.to_string(),
        };
        if worker_tx.send(TunnelMessage::Control(open)).await.is_err() {
            sessions.write().await.remove(session_id);
            return None;
        }
        Some(session_rx)
    }

    /// Forward one command frame to the worker hosting `session_id`.
    pub async fn send_input(&self, worker: &str, session_id: &str, frame: Vec<u8>) -> bool {
        let Some((worker_tx, _)) = self.connection(worker).await else {
            return false;
        };
        worker_tx
            .send(TunnelMessage::Stream(StreamFrame::input(session_id, frame)))
            .await
            .is_ok()
    }

    /// Stop routing output for `session_id`.
    pub async fn close_session(&self, worker: &str, session_id: &str) {
        if let Some((_, sessions)) = self.connection(worker).await {
            sessions.write().await.remove(session_id);
        }
    }

    /// Number of workers with a live connection.
    pub async fn connected_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Number of browser sessions routed through the relay.
    pub async fn session_count(&self) -> usize {
        let workers = self.workers.read().await;
        let mut total = 0;
        for worker in workers.values() {
            total += worker.sessions.read().await.len();
        }
        total
    }
}

/// Build the RPC router with the worker endpoint.
pub fn relay_router(relay_state: RelayState) -> Router {
    Router::new()
        .route("/rpc/worker", get(worker_register_ws))
        .with_state(relay_state)
}

// ─── Worker Registration ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterQuery {
    token: Option<String>,
}

/// Validate worker names: alphanumeric, dash, underscore, dot, 1-64 chars.
fn is_valid_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn reject_code(err: &RegistryError) -> RejectCode {
    match err {
        RegistryError::DuplicateIdentity { .. } => RejectCode::DuplicateIdentity,
    }
}

/// `GET /rpc/worker[?token=<worker_key>]` — worker WS registration.
async fn worker_register_ws(
    State(state): State<RelayState>,
    Query(query): Query<RegisterQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(key) = state.worker_key.as_deref() {
        let provided = query.token.as_deref().unwrap_or("");
        if !crate::auth::constant_time_eq(key.as_bytes(), provided.as_bytes()) {
            warn!("Worker connection with invalid worker key");
            return (StatusCode::FORBIDDEN, "Invalid worker key").into_response();
        }
    }

    ws.on_upgrade(move |socket| {
        handle_worker_ws(socket, state)
            .instrument(info_span!("tunnel_worker", worker = tracing::field::Empty))
    })
}

fn ws_message(msg: TunnelMessage) -> Message {
    match msg {
        TunnelMessage::Control(control) => {
            Message::Text(TunnelMessage::control_text(&control).into())
        }
        TunnelMessage::Stream(frame) => Message::Binary(frame.encode().into()),
    }
}

/// Wait for `worker.register` and turn it into a connect request.
async fn read_registration(ws_stream: &mut SplitStream<WebSocket>) -> Option<ConnectRequest> {
    let msg = tokio::time::timeout(REGISTER_TIMEOUT, ws_stream.next())
        .await
        .ok()??
        .ok()?;
    let Message::Text(text) = msg else {
        return None;
    };
    match serde_json::from_str::<ControlMessage>(&text).ok()? {
        ControlMessage::Register {
            process_name,
            host,
            mac,
            identity_token,
        } if is_valid_name(&process_name) && !identity_token.is_empty() => Some(ConnectRequest {
            process_name,
            host,
            mac,
            identity_token,
        }),
        _ => None,
    }
}

/// Handle one worker WebSocket connection from registration to close.
async fn handle_worker_ws(socket: WebSocket, state: RelayState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let Some(request) = read_registration(&mut ws_stream).await else {
        warn!("Worker sent invalid registration");
        let reject = ControlMessage::Rejected {
            code: RejectCode::InvalidRegistration,
            message: "expected worker.register with a valid process_name".to_string(),
        };
        let _ = ws_sink.send(ws_message(TunnelMessage::Control(reject))).await;
        let _ = ws_sink.close().await;
        return;
    };
    let name = request.process_name.clone();
    tracing::Span::current().record("worker", name.as_str());

    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (worker_tx, mut worker_rx) = mpsc::channel::<TunnelMessage>(WORKER_QUEUE);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
    let heartbeat_ms = Arc::new(AtomicU64::new(state.now_ms()));

    // The connect notification and the slot claim happen under the same
    // write lock, so a closing same-name connection either releases the slot
    // (and reports its disconnect) before this one connects, or finds the
    // slot already taken and reports nothing.
    {
        let mut workers = state.workers.write().await;
        if let Err(e) = state.registry.connect(request).await {
            drop(workers);
            let reject = ControlMessage::Rejected {
                code: reject_code(&e),
                message: e.to_string(),
            };
            let _ = ws_sink.send(ws_message(TunnelMessage::Control(reject))).await;
            let _ = ws_sink.close().await;
            return;
        }
        let worker = ConnectedWorker {
            conn_id,
            worker_tx: worker_tx.clone(),
            sessions: Arc::clone(&sessions),
            last_heartbeat_ms: Arc::clone(&heartbeat_ms),
            connected_since: Instant::now(),
            shutdown_tx,
        };
        // A same-name connection still in the map is stale: either the same
        // process reconnecting before its old socket died, or a newcomer
        // that took over an inactive name.
        if let Some(old) = workers.insert(name.clone(), worker) {
            warn!(worker = %name, "Worker re-registered while a stale connection exists, evicting old");
            let _ = old.shutdown_tx.send(true);
            drain_worker(&name, &old, "replaced by new connection").await;
        }
    }

    let accepted = ControlMessage::Accepted {
        process_name: name.clone(),
    };
    if ws_sink
        .send(ws_message(TunnelMessage::Control(accepted)))
        .await
        .is_err()
    {
        release_slot(&state, &name, conn_id).await;
        return;
    }
    info!(worker = %name, conn_id, "Worker tunnel established");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = worker_rx.recv().await {
            if ws_sink.send(ws_message(msg)).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                msg
            }
            _ = shutdown_rx.changed() => {
                info!(worker = %name, "Worker handler shutting down (replaced or evicted)");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ControlMessage>(&text) {
                Ok(ControlMessage::Ping) => {
                    heartbeat_ms.store(state.now_ms(), Ordering::Relaxed);
                    let _ = worker_tx
                        .send(TunnelMessage::Control(ControlMessage::Pong))
                        .await;
                }
                Ok(ControlMessage::TerminalClosed { session_id, reason }) => {
                    let removed = sessions.write().await.remove(&session_id);
                    match removed {
                        Some(session_tx) => {
                            debug!(worker = %name, session_id = %session_id, %reason, "Worker closed session");
                            let _ = session_tx.try_send(SessionSignal::Closed(reason));
                        }
                        None => debug!(worker = %name, session_id = %session_id, "Close for unknown session"),
                    }
                }
                Ok(other) => warn!(worker = %name, ?other, "Unexpected control message from worker"),
                Err(e) => warn!(worker = %name, "Malformed control message from worker: {e}"),
            },
            Message::Binary(data) => route_output(&name, &sessions, &data).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    release_slot(&state, &name, conn_id).await;
}

/// Give up the connection slot for `name` if `conn_id` still holds it, and
/// report the disconnect. The registry is updated before the slot lock is
/// released so a concurrent reconnect cannot be marked inactive.
async fn release_slot(state: &RelayState, name: &str, conn_id: u64) {
    let mut workers = state.workers.write().await;
    if !workers.get(name).is_some_and(|w| w.conn_id == conn_id) {
        debug!(worker = %name, conn_id, "Superseded worker tunnel closed");
        return;
    }
    if let Some(worker) = workers.remove(name) {
        drain_worker(name, &worker, "worker disconnected").await;
    }
    info!(worker = %name, conn_id, "Worker tunnel closed");
    state.registry.disconnect(name).await;
}

/// Route one `terminal.output` frame to its browser session.
///
/// Never blocks: a session whose queue is full or closed is dropped, which
/// ends its browser socket.
async fn route_output(name: &str, sessions: &SessionMap, data: &[u8]) {
    let Some(frame) = StreamFrame::decode(data) else {
        warn!(worker = %name, "Malformed stream frame from worker");
        return;
    };
    if frame.kind != StreamKind::Output {
        warn!(worker = %name, kind = ?frame.kind, "Unexpected stream frame from worker");
        return;
    }

    let delivered = {
        let sessions_read = sessions.read().await;
        let Some(session_tx) = sessions_read.get(&frame.session_id) else {
            debug!(worker = %name, session_id = %frame.session_id, "Output for unknown session dropped");
            return;
        };
        match session_tx.try_send(SessionSignal::Output(frame.payload)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(worker = %name, session_id = %frame.session_id, "Browser not keeping up, dropping session");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    };
    if !delivered {
        sessions.write().await.remove(&frame.session_id);
    }
}
