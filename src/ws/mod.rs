//! Browser-facing WebSockets on the web listener.
//!
//! | Path                               | Frames       | Handler                 |
//! |------------------------------------|--------------|-------------------------|
//! | `/director`                        | JSON text    | [`director::director_ws`] |
//! | `/terminal?worker_id=<processName>`| binary       | [`terminal::terminal_ws`] |
//!
//! ## `/director`
//!
//! On connect the server sends the full worker roster, a JSON array of
//! `{host, mac, processName, id, active}`, and pushes the same shape on every
//! change. The client may send `{"command": "delete_terminal", "termId": name}`
//! to forget an inactive worker.
//!
//! ## `/terminal`
//!
//! Client → server frames are command frames (`'1'` + bytes = data,
//! `'2'` + `"rows,cols"` = resize, empty = stop). Server → client frames are
//! raw PTY output. Closing either side tears the session down.

pub mod director;
pub mod terminal;

use axum::{routing::get, Router};

use crate::state::RouterState;

/// WebSocket routes for the web listener.
pub fn router() -> Router<RouterState> {
    Router::new()
        .route("/director", get(director::director_ws))
        .route("/terminal", get(terminal::terminal_ws))
}
