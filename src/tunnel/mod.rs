//! Worker ↔ router tunnel.
//!
//! Workers dial out to the router's RPC listener and keep one WebSocket open
//! for their whole lifetime:
//!
//! - **Relay** ([`relay`], router side): accepts worker registrations, feeds
//!   connect/disconnect notifications into the registry, and routes terminal
//!   byte streams between browser sessions and workers.
//! - **Client** ([`client`], worker side): registers, heartbeats, reconnects
//!   with backoff, and hands terminal traffic to the session multiplexer.
//!
//! Control messages are JSON text frames ([`ControlMessage`]). Terminal bytes
//! travel as binary frames: `u32 BE header length | JSON header | payload`
//! ([`StreamFrame`]).

pub mod client;
pub mod relay;

use serde::{Deserialize, Serialize};

/// Why the router refused a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    /// Another live process already owns the requested name.
    DuplicateIdentity,
    /// The registration frame was missing or malformed.
    InvalidRegistration,
}

/// JSON control messages exchanged over the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// First frame from a worker: the connect notification.
    #[serde(rename = "worker.register")]
    Register {
        process_name: String,
        host: String,
        mac: String,
        identity_token: String,
    },
    #[serde(rename = "worker.accepted")]
    Accepted { process_name: String },
    #[serde(rename = "worker.rejected")]
    Rejected { code: RejectCode, message: String },
    #[serde(rename = "tunnel.ping")]
    Ping,
    #[serde(rename = "tunnel.pong")]
    Pong,
    /// Router asks the worker to start a PTY for `session_id`.
    #[serde(rename = "terminal.open")]
    TerminalOpen { session_id: String },
    /// Worker reports that a session's output has ended.
    #[serde(rename = "terminal.closed")]
    TerminalClosed { session_id: String, reason: String },
    /// Router is going away on purpose; reconnect after the base delay.
    #[serde(rename = "router.shutdown")]
    RouterShutdown,
}

/// Direction of a binary stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    /// PTY output, worker → router.
    #[serde(rename = "terminal.output")]
    Output,
    /// One command frame, router → worker.
    #[serde(rename = "terminal.input")]
    Input,
}

#[derive(Serialize, Deserialize)]
struct FrameHeader {
    #[serde(rename = "type")]
    kind: StreamKind,
    session_id: String,
}

/// One chunk of a session's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub kind: StreamKind,
    pub session_id: String,
    pub payload: Vec<u8>,
}

impl StreamFrame {
    pub fn output(session_id: &str, payload: Vec<u8>) -> Self {
        Self {
            kind: StreamKind::Output,
            session_id: session_id.to_string(),
            payload,
        }
    }

    pub fn input(session_id: &str, payload: Vec<u8>) -> Self {
        Self {
            kind: StreamKind::Input,
            session_id: session_id.to_string(),
            payload,
        }
    }

    /// Encode as a binary WebSocket payload.
    pub fn encode(&self) -> Vec<u8> {
        let header = serde_json::to_vec(&FrameHeader {
            kind: self.kind,
            session_id: self.session_id.clone(),
        })
        .unwrap_or_default();
        #[allow(clippy::cast_possible_truncation)]
        let len = header.len() as u32;
        let mut out = Vec::with_capacity(4 + header.len() + self.payload.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a binary WebSocket payload. `None` if truncated or malformed.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let len_bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        let header_end = 4usize.checked_add(len)?;
        let header: FrameHeader = serde_json::from_slice(data.get(4..header_end)?).ok()?;
        Some(Self {
            kind: header.kind,
            session_id: header.session_id,
            payload: data[header_end..].to_vec(),
        })
    }
}

/// Anything queued for the tunnel writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMessage {
    Control(ControlMessage),
    Stream(StreamFrame),
}

impl TunnelMessage {
    /// Serialize a control message to its JSON text form.
    pub fn control_text(msg: &ControlMessage) -> String {
        serde_json::to_string(msg).unwrap_or_default()
    }
}
