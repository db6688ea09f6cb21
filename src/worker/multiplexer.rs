//! Worker-side session multiplexer.
//!
//! Maps each terminal session id to one [`PtySession`] and pumps bytes both
//! ways:
//!
//! - **Inbound**: raw command frames delivered for a session are decoded in
//!   order. `Data` is written to the PTY, `Resize` resizes it, `Stop` stops it
//!   and ends the dispatch loop. If the inbound stream ends without `Stop`
//!   (the router vanished), the PTY is force-stopped.
//! - **Outbound**: PTY output chunks are forwarded as
//!   [`SessionEvent::Output`] and followed by exactly one
//!   [`SessionEvent::Closed`] once the output ends (child exit, stop, or the
//!   event sink is gone).
//!
//! A session stays addressable by id until its output has ended, so a late
//! `Stop` still reaches it. Nothing is reaped on a timer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::protocol::Command;
use crate::shell::session::{PtyOutput, PtySession, SpawnOptions};

/// Why a session's output ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The shell exited on its own.
    Exited,
    /// A `Stop` command (or an abandoned input stream) stopped it.
    Stopped,
    /// Nobody is reading the output anymore.
    TransportClosed,
    /// No PTY or shell could be started.
    SpawnFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Exited => write!(f, "exited"),
            CloseReason::Stopped => write!(f, "stopped"),
            CloseReason::TransportClosed => write!(f, "transport closed"),
            CloseReason::SpawnFailed(e) => write!(f, "spawn failed: {e}"),
        }
    }
}

/// Outbound traffic produced by sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output { session_id: String, data: Vec<u8> },
    Closed { session_id: String, reason: CloseReason },
}

type InputMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Cloneable — all clones share the same session map.
#[derive(Clone)]
pub struct SessionMultiplexer {
    inputs: InputMap,
    opts: SpawnOptions,
}

impl SessionMultiplexer {
    pub fn new(opts: SpawnOptions) -> Self {
        Self {
            inputs: Arc::new(Mutex::new(HashMap::new())),
            opts,
        }
    }

    /// Start a PTY session and its pumps. Events go to `events`.
    ///
    /// A spawn failure only produces `Closed { SpawnFailed }` for this id. The
    /// session map is locked only to check and insert, and nothing here waits
    /// on `events`, so other sessions keep receiving input meanwhile.
    pub async fn open(&self, session_id: &str, events: mpsc::Sender<SessionEvent>) {
        if self.inputs.lock().await.contains_key(session_id) {
            warn!(session_id, "Session already open, ignoring duplicate open");
            return;
        }

        let (pty, output) = match PtySession::spawn(session_id, &self.opts) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(session_id, "PTY spawn failed: {e}");
                let closed = SessionEvent::Closed {
                    session_id: session_id.to_string(),
                    reason: CloseReason::SpawnFailed(e.to_string()),
                };
                tokio::spawn(async move {
                    let _ = events.send(closed).await;
                });
                return;
            }
        };

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        {
            let mut inputs = self.inputs.lock().await;
            if inputs.contains_key(session_id) {
                // Lost a race with another open for the same id; dropping the
                // session kills its shell.
                warn!(session_id, "Session already open, discarding new PTY");
                return;
            }
            inputs.insert(session_id.to_string(), input_tx);
        }

        let pty = Arc::new(pty);
        tokio::spawn(dispatch_input(Arc::clone(&pty), input_rx));
        tokio::spawn(pump_output(
            session_id.to_string(),
            pty,
            output,
            events,
            Arc::clone(&self.inputs),
        ));
    }

    /// Route one inbound command frame. Returns `false` for unknown sessions.
    pub async fn deliver(&self, session_id: &str, frame: Vec<u8>) -> bool {
        let inputs = self.inputs.lock().await;
        let Some(tx) = inputs.get(session_id) else {
            debug!(session_id, "Frame for unknown session dropped");
            return false;
        };
        tx.send(frame).is_ok()
    }

    /// Abandon every inbound stream; each session is then force-stopped.
    pub async fn shutdown(&self) {
        let mut inputs = self.inputs.lock().await;
        if !inputs.is_empty() {
            info!(count = inputs.len(), "Abandoning all terminal sessions");
        }
        inputs.clear();
    }

    pub async fn session_count(&self) -> usize {
        self.inputs.lock().await.len()
    }
}

async fn dispatch_input(pty: Arc<PtySession>, mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    let session_id = pty.session_id().to_string();
    loop {
        let Some(frame) = input_rx.recv().await else {
            if pty.is_running() {
                warn!(session_id = %session_id, "Input stream ended without Stop, stopping PTY");
            }
            pty.stop().await;
            return;
        };
        let applied = match Command::decode(&frame) {
            Ok(Command::Data(data)) => pty.write(&data),
            Ok(Command::Resize { rows, cols }) => {
                debug!(session_id = %session_id, rows, cols, "Resize");
                pty.resize(rows, cols)
            }
            Ok(Command::Stop) => {
                info!(session_id = %session_id, "Stop received");
                pty.stop().await;
                return;
            }
            Err(e) => {
                warn!(session_id = %session_id, "Dropping malformed command: {e}");
                Ok(())
            }
        };
        if let Err(e) = applied {
            debug!(session_id = %session_id, "PTY no longer accepts input: {e}");
        }
    }
}

async fn pump_output(
    session_id: String,
    pty: Arc<PtySession>,
    mut output: PtyOutput,
    events: mpsc::Sender<SessionEvent>,
    inputs: InputMap,
) {
    let mut sink_gone = false;
    while let Some(data) = output.next().await {
        let event = SessionEvent::Output {
            session_id: session_id.clone(),
            data,
        };
        if events.send(event).await.is_err() {
            sink_gone = true;
            break;
        }
    }
    // Decided before the input sender is removed: removing it wakes the
    // dispatch task, which stops the PTY.
    let reason = if sink_gone {
        CloseReason::TransportClosed
    } else if pty.was_stopped() {
        CloseReason::Stopped
    } else {
        CloseReason::Exited
    };
    if sink_gone {
        pty.stop().await;
    }

    inputs.lock().await.remove(&session_id);
    info!(session_id = %session_id, %reason, "Terminal session closed");
    let _ = events
        .send(SessionEvent::Closed { session_id, reason })
        .await;
}
