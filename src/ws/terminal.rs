//! Browser terminal sessions.
//!
//! Each `/terminal` socket is one session with a fresh id. Browser frames are
//! validated, queued in order on an unbounded inbound queue and forwarded to
//! the worker by a dedicated task; worker output is written back to the
//! socket by a second task. When the browser goes away a `Stop` is queued and
//! output forwarding is cancelled. When the worker ends the session (shell
//! exit or lost tunnel) the socket is closed normally.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::protocol::Command;
use crate::state::RouterState;
use crate::tunnel::relay::SessionSignal;

/// Query parameters for the terminal WebSocket upgrade.
#[derive(Deserialize)]
pub struct TerminalQuery {
    /// Process name of the worker that should host the shell.
    pub worker_id: String,
}

/// `GET /terminal?worker_id=<processName>` — WebSocket upgrade handler.
pub async fn terminal_ws(
    State(state): State<RouterState>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let session_id = Uuid::new_v4().to_string();
    let span = info_span!("terminal", worker = %query.worker_id, session_id = %session_id);
    ws.on_upgrade(move |socket| {
        handle_terminal(socket, state, query.worker_id, session_id).instrument(span)
    })
}

/// Validate a browser frame and queue it for the worker.
fn enqueue(input_tx: &mpsc::UnboundedSender<Vec<u8>>, frame: Vec<u8>) {
    match Command::decode(&frame) {
        Ok(_) => {
            let _ = input_tx.send(frame);
        }
        Err(e) => warn!("Dropping invalid frame from browser: {e}"),
    }
}

async fn handle_terminal(socket: WebSocket, state: RouterState, worker: String, session_id: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    if !state.registry.is_active(&worker).await {
        info!("Terminal requested for unknown or inactive worker");
        let _ = ws_sink.close().await;
        return;
    }
    let Some(mut signals) = state.relay.open_session(&worker, &session_id).await else {
        warn!("Worker is active but has no live tunnel");
        let _ = ws_sink.close().await;
        return;
    };
    info!("Terminal session opened");

    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let forward_task = {
        let relay = state.relay.clone();
        let worker = worker.clone();
        let session_id = session_id.clone();
        tokio::spawn(
            async move {
                while let Some(frame) = input_rx.recv().await {
                    let stop = Command::is_stop_frame(&frame);
                    if !relay.send_input(&worker, &session_id, frame).await {
                        debug!("Worker tunnel gone, discarding input");
                        break;
                    }
                    if stop {
                        break;
                    }
                }
            }
            .in_current_span(),
        )
    };

    let mut output_task = tokio::spawn(
        async move {
            while let Some(signal) = signals.recv().await {
                match signal {
                    SessionSignal::Output(data) => {
                        if ws_sink.send(Message::Binary(data.into())).await.is_err() {
                            return;
                        }
                    }
                    SessionSignal::Closed(reason) => {
                        info!(%reason, "Worker ended the session");
                        break;
                    }
                    SessionSignal::Lost => {
                        warn!("Worker connection lost");
                        break;
                    }
                }
            }
            let _ = ws_sink.close().await;
        }
        .in_current_span(),
    );

    let mut output_done = false;
    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Binary(frame) => enqueue(&input_tx, frame.to_vec()),
                    Message::Text(text) => enqueue(&input_tx, text.as_bytes().to_vec()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = &mut output_task => {
                output_done = true;
                break;
            }
        }
    }

    // Harmless when the worker already ended the session.
    let _ = input_tx.send(Command::Stop.encode());
    drop(input_tx);
    if !output_done {
        output_task.abort();
    }
    state.relay.close_session(&worker, &session_id).await;
    // Detached: it delivers the queued Stop and exits on its own.
    drop(forward_task);
    info!("Terminal session closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::config::{Config, WorkerConfig};
    use crate::shell::session::SpawnOptions;
    use crate::tunnel::{client, relay::relay_router};
    use crate::worker::multiplexer::SessionMultiplexer;
    use crate::worker::WorkerIdentity;

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    /// Web and RPC listeners on ephemeral ports.
    async fn serve() -> (RouterState, String, String) {
        let state = RouterState::new(Config::default());

        let web = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let web_addr = web.local_addr().unwrap();
        let app = crate::ws::router().with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(web, app).await.unwrap();
        });

        let rpc = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rpc_addr = rpc.local_addr().unwrap();
        let rpc_app = relay_router(state.relay.clone());
        tokio::spawn(async move {
            axum::serve(rpc, rpc_app).await.unwrap();
        });

        (
            state,
            format!("ws://{web_addr}"),
            format!("ws://{rpc_addr}/rpc/worker"),
        )
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

    async fn start_worker(state: &RouterState, rpc_url: &str, name: &str, mux: SessionMultiplexer) {
        let config = WorkerConfig {
            router_url: rpc_url.to_string(),
            ..WorkerConfig::default()
        };
        tokio::spawn(client::run(
            WorkerIdentity::generate(Some(name.to_string())),
            config,
            mux,
        ));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while state.relay.connected_count().await == 0 {
            assert!(tokio::time::Instant::now() < deadline, "worker never connected");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn read_until(ws: &mut Client, needle: &str) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !seen.contains(needle) {
            let msg = tokio::time::timeout_at(deadline, ws.next())
                .await
                .expect("timed out waiting for terminal output")
                .expect("terminal closed early")
                .unwrap();
            if let WsMessage::Binary(data) = msg {
                seen.push_str(&String::from_utf8_lossy(&data));
            }
        }
        seen
    }

    async fn expect_closed(ws: &mut Client) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            match tokio::time::timeout_at(deadline, ws.next()).await {
                Err(_) => panic!("socket was not closed"),
                Ok(None | Some(Err(_) | Ok(WsMessage::Close(_)))) => return,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    #[tokio::test]
    async fn unknown_worker_closes_immediately() {
        let (_state, web, _rpc) = serve().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{web}/terminal?worker_id=ghost"))
            .await
            .unwrap();
        expect_closed(&mut ws).await;
    }

    #[tokio::test]
    async fn browser_drives_remote_shell() {
        let (state, web, rpc) = serve().await;
        let worker_mux = mux();
        start_worker(&state, &rpc, "alpha", worker_mux.clone()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{web}/terminal?worker_id=alpha"))
            .await
            .unwrap();
        ws.send(WsMessage::binary(Command::Resize { rows: 40, cols: 120 }.encode()))
            .await
            .unwrap();
        ws.send(WsMessage::binary(b"1stty size; echo mark-$((5*5))\n".to_vec()))
            .await
            .unwrap();
        let seen = read_until(&mut ws, "mark-25").await;
        assert!(seen.contains("40 120"), "unexpected output: {seen:?}");

        // Invalid frames are dropped, not fatal.
        ws.send(WsMessage::binary(b"9junk".to_vec())).await.unwrap();
        ws.send(WsMessage::binary(b"1echo still-$((1+2))\n".to_vec()))
            .await
            .unwrap();
        read_until(&mut ws, "still-3").await;

        ws.close(None).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while worker_mux.session_count().await > 0 || state.relay.session_count().await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "session not torn down");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn shell_exit_closes_browser_socket() {
        let (state, web, rpc) = serve().await;
        start_worker(&state, &rpc, "alpha", mux()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{web}/terminal?worker_id=alpha"))
            .await
            .unwrap();
        ws.send(WsMessage::binary(b"1exit\n".to_vec())).await.unwrap();
        expect_closed(&mut ws).await;
    }
}
