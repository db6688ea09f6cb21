//! Dashboard ("director") connections: live roster pushes and commands.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::registry::Worker;
use crate::state::RouterState;

/// Commands a director may send.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
enum DirectorCommand {
    /// Forget an inactive worker.
    DeleteTerminal {
        #[serde(rename = "termId", alias = "term_id")]
        term_id: String,
    },
}

/// `GET /director` — WebSocket upgrade handler.
pub async fn director_ws(State(state): State<RouterState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_director(socket, state).instrument(info_span!("director")))
}

fn roster_message(roster: &[Worker]) -> Option<Message> {
    match serde_json::to_string(roster) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("Failed to serialize roster: {e}");
            None
        }
    }
}

async fn handle_director(socket: WebSocket, state: RouterState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Subscribe before taking the snapshot so no change falls in between.
    let mut subscription = state.bus.subscribe().await;
    let id = subscription.id;
    info!(director = id, "Director connected");

    let initial = state.registry.roster().await;
    let sent = match roster_message(&initial) {
        Some(msg) => ws_sink.send(msg).await.is_ok(),
        None => true,
    };

    if sent {
        loop {
            tokio::select! {
                roster = subscription.rx.recv() => {
                    // `None`: the bus dropped us for falling behind.
                    let Some(roster) = roster else { break };
                    let Some(msg) = roster_message(&roster) else { continue };
                    if ws_sink.send(msg).await.is_err() {
                        break;
                    }
                }
                msg = ws_stream.next() => {
                    let Some(Ok(msg)) = msg else { break };
                    match msg {
                        Message::Text(text) => handle_command(&state, id, &text).await,
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }
    }

    state.bus.unsubscribe(id).await;
    info!(director = id, "Director disconnected");
}

async fn handle_command(state: &RouterState, id: u64, text: &str) {
    match serde_json::from_str::<DirectorCommand>(text) {
        Ok(DirectorCommand::DeleteTerminal { term_id }) => {
            debug!(director = id, worker = %term_id, "delete_terminal");
            state.registry.remove(&term_id).await;
        }
        Err(e) => warn!(director = id, "Ignoring director message: {e}"),
    }
}
