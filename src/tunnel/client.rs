//! Tunnel client — outbound WS connection from worker to router.
//!
//! Maintains a persistent WebSocket to the router's RPC listener with
//! exponential-backoff reconnect and heartbeat. Every connection starts with
//! `worker.register`; a `DUPLICATE_IDENTITY` rejection is fatal and ends
//! [`run`] with an error instead of retrying. `wss://` routers are dialed
//! through the connector from [`crate::tls::connector`].

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tracing::{debug, error, info, warn};

use super::{ControlMessage, RejectCode, StreamFrame, StreamKind, TunnelMessage};
use crate::config::WorkerConfig;
use crate::tls::{self, TlsError};
use crate::worker::multiplexer::{SessionEvent, SessionMultiplexer};
use crate::worker::WorkerIdentity;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long the router may take to answer `worker.register`.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Control messages queued for the writer (heartbeats).
const CONTROL_QUEUE: usize = 16;

/// Session events queued for the writer.
const EVENT_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("router rejected registration ({code:?}): {message}")]
    Rejected { code: RejectCode, message: String },
    #[error("router did not acknowledge registration")]
    NotAccepted,
    #[error("unexpected message from router: {0}")]
    Protocol(String),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TunnelError::WebSocket(Box::new(e))
    }
}

impl TunnelError {
    /// Errors after which reconnecting cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Rejected {
                code: RejectCode::DuplicateIdentity,
                ..
            } | TunnelError::Tls(_)
        )
    }
}

/// Reason an accepted tunnel connection ended.
#[derive(Debug, PartialEq, Eq)]
enum DisconnectReason {
    /// Router sent `router.shutdown`; backoff restarts from the base delay.
    RouterShutdown,
    /// Close frame, EOF or read error.
    Closed,
}

/// Reconnect delays: doubling from `base` up to `max`, back to `base`
/// whenever an accepted connection ends.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(config: &WorkerConfig) -> Self {
        let base = Duration::from_secs(config.reconnect_delay_secs.max(1));
        let max = Duration::from_secs(config.reconnect_max_delay_secs).max(base);
        Self {
            base,
            max,
            next: base,
        }
    }

    /// Delay after an accepted connection ended (including `router.shutdown`).
    fn after_disconnect(&mut self) -> Duration {
        self.next = self.base;
        self.after_failure()
    }

    /// Delay after a failed attempt.
    fn after_failure(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(self.max);
        delay
    }
}

/// Main loop: connect, serve sessions, reconnect on failure.
///
/// Returns only on a fatal error.
pub async fn run(
    identity: WorkerIdentity,
    config: WorkerConfig,
    mux: SessionMultiplexer,
) -> Result<(), TunnelError> {
    let connector = tls::connector(config.ssl_cert.as_deref(), config.ssl_key.as_deref())
        .inspect_err(|e| error!(worker = %identity.process_name, "Tunnel: {e}"))?;
    let mut backoff = Backoff::new(&config);

    loop {
        info!(worker = %identity.process_name, "Tunnel: connecting to router at {}", config.router_url);
        let result = connect_and_run(&identity, &config, connector.clone(), &mux).await;
        // Sessions never survive their connection.
        mux.shutdown().await;

        let delay = match result {
            Ok(DisconnectReason::RouterShutdown) => {
                let delay = backoff.after_disconnect();
                info!("Tunnel: router shutting down, reconnecting in {}s", delay.as_secs());
                delay
            }
            Ok(DisconnectReason::Closed) => {
                let delay = backoff.after_disconnect();
                info!("Tunnel: connection closed, reconnecting in {}s", delay.as_secs());
                delay
            }
            Err(e) if e.is_fatal() => {
                error!(worker = %identity.process_name, "Tunnel: {e}");
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.after_failure();
                warn!("Tunnel: {e}, reconnecting in {}s", delay.as_secs());
                delay
            }
        };
        tokio::time::sleep(delay).await;
    }
}

/// Router URL with the worker key appended as `token`.
fn tunnel_url(router_url: &str, worker_key: Option<&str>) -> String {
    match worker_key.filter(|k| !k.is_empty()) {
        Some(key) => {
            let sep = if router_url.contains('?') { '&' } else { '?' };
            format!("{router_url}{sep}token={key}")
        }
        None => router_url.to_string(),
    }
}

fn ws_message(msg: TunnelMessage) -> Message {
    match msg {
        TunnelMessage::Control(control) => Message::text(TunnelMessage::control_text(&control)),
        TunnelMessage::Stream(frame) => Message::binary(frame.encode()),
    }
}

fn event_message(event: SessionEvent) -> TunnelMessage {
    match event {
        SessionEvent::Output { session_id, data } => {
            TunnelMessage::Stream(StreamFrame::output(&session_id, data))
        }
        SessionEvent::Closed { session_id, reason } => {
            TunnelMessage::Control(ControlMessage::TerminalClosed {
                session_id,
                reason: reason.to_string(),
            })
        }
    }
}

/// Wait for the router's answer to `worker.register`.
async fn await_acceptance(ws_stream: &mut WsSource) -> Result<(), TunnelError> {
    let msg = tokio::time::timeout(ACCEPT_TIMEOUT, ws_stream.next())
        .await
        .map_err(|_| TunnelError::NotAccepted)?
        .ok_or(TunnelError::NotAccepted)??;
    let Message::Text(text) = msg else {
        return Err(TunnelError::NotAccepted);
    };
    match serde_json::from_str::<ControlMessage>(&text) {
        Ok(ControlMessage::Accepted { .. }) => Ok(()),
        Ok(ControlMessage::Rejected { code, message }) => {
            Err(TunnelError::Rejected { code, message })
        }
        Ok(other) => Err(TunnelError::Protocol(format!("{other:?}"))),
        Err(e) => Err(TunnelError::Protocol(e.to_string())),
    }
}

/// Drain heartbeats and session events into the socket.
async fn writer_task(
    mut ws_sink: WsSink,
    mut control_rx: mpsc::Receiver<TunnelMessage>,
    mut event_rx: mpsc::Receiver<SessionEvent>,
) {
    loop {
        let msg = tokio::select! {
            Some(msg) = control_rx.recv() => msg,
            Some(event) = event_rx.recv() => event_message(event),
            else => break,
        };
        if let Err(e) = ws_sink.send(ws_message(msg)).await {
            debug!("Tunnel: write failed: {e}");
            break;
        }
    }
}

/// A single connection attempt: connect, register, handle messages until disconnect.
async fn connect_and_run(
    identity: &WorkerIdentity,
    config: &WorkerConfig,
    connector: Option<Connector>,
    mux: &SessionMultiplexer,
) -> Result<DisconnectReason, TunnelError> {
    let url = tunnel_url(&config.router_url, config.worker_key.as_deref());
    let (ws, _response) =
        tokio_tungstenite::connect_async_tls_with_config(url, None, false, connector).await?;
    let (mut ws_sink, mut ws_stream) = ws.split();

    ws_sink
        .send(ws_message(TunnelMessage::Control(identity.register_message())))
        .await?;
    await_acceptance(&mut ws_stream).await?;
    info!(worker = %identity.process_name, "Tunnel: registered with router");

    let (control_tx, control_rx) = mpsc::channel::<TunnelMessage>(CONTROL_QUEUE);
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(EVENT_QUEUE);
    let writer = tokio::spawn(writer_task(ws_sink, control_rx, event_rx));

    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs.max(1));
    let heartbeat = tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval);
        loop {
            interval.tick().await;
            if control_tx
                .send(TunnelMessage::Control(ControlMessage::Ping))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut reason = DisconnectReason::Closed;
    while let Some(msg) = ws_stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Tunnel: read error: {e}");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ControlMessage>(&text) {
                Ok(ControlMessage::TerminalOpen { session_id }) => {
                    info!(session_id = %session_id, "Tunnel: opening terminal session");
                    mux.open(&session_id, event_tx.clone()).await;
                }
                Ok(ControlMessage::Pong) => {}
                Ok(ControlMessage::RouterShutdown) => {
                    info!("Tunnel: router sent shutdown notification");
                    reason = DisconnectReason::RouterShutdown;
                    break;
                }
                Ok(other) => warn!(?other, "Tunnel: unexpected control message"),
                Err(e) => warn!("Tunnel: malformed control message: {e}"),
            },
            Message::Binary(data) => match StreamFrame::decode(&data) {
                Some(frame) if frame.kind == StreamKind::Input => {
                    mux.deliver(&frame.session_id, frame.payload).await;
                }
                _ => warn!("Tunnel: malformed stream frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    heartbeat.abort();
    writer.abort();
    Ok(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::director::DirectorBus;
    use crate::protocol::Command;
    use crate::registry::WorkerRegistry;
    use crate::shell::session::SpawnOptions;
    use crate::tunnel::relay::{relay_router, RelayState, SessionSignal};

    async fn router() -> (RelayState, String) {
        let state = RelayState::new(WorkerRegistry::new(DirectorBus::new()), None, 90);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = relay_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, format!("ws://{addr}/rpc/worker"))
    }

    fn worker_config(router_url: &str) -> WorkerConfig {
        WorkerConfig {
            router_url: router_url.to_string(),
            ..WorkerConfig::default()
        }
    }

    fn mux() -> SessionMultiplexer {
        SessionMultiplexer::new(SpawnOptions {
            shell: "/bin/sh".to_string(),
            max_chunk: 4096,
            rows: 24,
            cols: 80,
            stop_grace: Duration::from_millis(300),
        })
    }

    async fn wait_active(state: &RelayState, name: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !(state.registry.is_active(name).await && state.connected_count().await == 1) {
            assert!(tokio::time::Instant::now() < deadline, "{name} never connected");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn worker_key_is_appended_as_token() {
        assert_eq!(tunnel_url("ws://r/rpc/worker", None), "ws://r/rpc/worker");
        assert_eq!(tunnel_url("ws://r/rpc/worker", Some("")), "ws://r/rpc/worker");
        assert_eq!(
            tunnel_url("ws://r/rpc/worker", Some("k")),
            "ws://r/rpc/worker?token=k"
        );
        assert_eq!(
            tunnel_url("ws://r/rpc/worker?x=1", Some("k")),
            "ws://r/rpc/worker?x=1&token=k"
        );
    }

    #[test]
    fn only_duplicate_identity_is_fatal() {
        let dup = TunnelError::Rejected {
            code: RejectCode::DuplicateIdentity,
            message: String::new(),
        };
        let invalid = TunnelError::Rejected {
            code: RejectCode::InvalidRegistration,
            message: String::new(),
        };
        assert!(dup.is_fatal());
        assert!(!invalid.is_fatal());
        assert!(!TunnelError::NotAccepted.is_fatal());
        assert!(TunnelError::Tls(TlsError::KeyWithoutCert).is_fatal());
    }

    #[test]
    fn backoff_doubles_on_failure_and_restarts_after_disconnect() {
        let mut backoff = Backoff::new(&WorkerConfig {
            reconnect_delay_secs: 2,
            reconnect_max_delay_secs: 10,
            ..WorkerConfig::default()
        });
        let secs = |d: Duration| d.as_secs();
        assert_eq!(secs(backoff.after_failure()), 2);
        assert_eq!(secs(backoff.after_failure()), 4);
        assert_eq!(secs(backoff.after_failure()), 8);
        assert_eq!(secs(backoff.after_failure()), 10);
        assert_eq!(secs(backoff.after_failure()), 10);

        // router.shutdown: base delay, not zero and not the grown delay.
        assert_eq!(secs(backoff.after_disconnect()), 2);
        assert_eq!(secs(backoff.after_failure()), 4);
    }

    #[tokio::test]
    async fn key_without_cert_stops_the_worker() {
        let config = WorkerConfig {
            ssl_key: Some(crate::tls::tests::KEY.to_string()),
            ..worker_config("wss://127.0.0.1:1/rpc/worker")
        };
        let err = run(WorkerIdentity::generate(Some("alpha".into())), config, mux())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Tls(TlsError::KeyWithoutCert)));
    }

    #[tokio::test]
    async fn worker_registers_over_tls() {
        let state = RelayState::new(WorkerRegistry::new(DirectorBus::new()), None, 90);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tls_config = crate::tls::server_config(
            Some(crate::tls::tests::CERT),
            Some(crate::tls::tests::KEY),
        )
        .await
        .unwrap();
        let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(crate::tls::serve(
            listener,
            relay_router(state.clone()),
            tls_config,
            stop_rx,
        ));

        let config = WorkerConfig {
            ssl_cert: Some(crate::tls::tests::CERT.to_string()),
            ..worker_config(&format!("wss://{addr}/rpc/worker"))
        };
        let worker = tokio::spawn(run(
            WorkerIdentity::generate(Some("secure".into())),
            config,
            mux(),
        ));
        wait_active(&state, "secure").await;
        worker.abort();
    }

    #[tokio::test]
    async fn browser_bytes_reach_the_shell_and_back() {
        let (state, url) = router().await;
        let identity = WorkerIdentity::generate(Some("alpha".into()));
        let worker = tokio::spawn(run(identity, worker_config(&url), mux()));
        wait_active(&state, "alpha").await;

        let mut signals = state.open_session("alpha", "s1").await.unwrap();
        let cmd = Command::Data(b"echo relay-$((20+22))\n".to_vec()).encode();
        assert!(state.send_input("alpha", "s1", cmd).await);

        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !seen.contains("relay-42") {
            match tokio::time::timeout_at(deadline, signals.recv()).await {
                Ok(Some(SessionSignal::Output(data))) => seen.push_str(&String::from_utf8_lossy(&data)),
                other => panic!("unexpected signal {other:?} after {seen:?}"),
            }
        }

        assert!(state.send_input("alpha", "s1", Command::Stop.encode()).await);
        let closed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match signals.recv().await {
                    Some(SessionSignal::Output(_)) => {}
                    other => return other,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(closed, Some(SessionSignal::Closed("stopped".into())));

        worker.abort();
    }

    #[tokio::test]
    async fn duplicate_identity_ends_the_worker() {
        let (state, url) = router().await;
        let first = tokio::spawn(run(
            WorkerIdentity::generate(Some("alpha".into())),
            worker_config(&url),
            mux(),
        ));
        wait_active(&state, "alpha").await;

        let second = run(
            WorkerIdentity::generate(Some("alpha".into())),
            worker_config(&url),
            mux(),
        );
        let err = tokio::time::timeout(Duration::from_secs(10), second)
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(!state.registry.is_active("alpha").await);

        first.abort();
    }
}
