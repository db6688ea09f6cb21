//! Worker process: identity plus the session multiplexer behind the tunnel.

pub mod machine;
pub mod multiplexer;

use uuid::Uuid;

use crate::tunnel::ControlMessage;

/// Who this worker process claims to be. Generated once per process and
/// reused across reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub process_name: String,
    pub host: String,
    pub mac: String,
    /// Random per-instance value; a restarted process gets a new one.
    pub identity_token: String,
}

impl WorkerIdentity {
    /// Build this process's identity. `name` falls back to `worker-<8 hex>`.
    pub fn generate(name: Option<String>) -> Self {
        Self {
            process_name: name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(default_name),
            host: machine::hostname(),
            mac: machine::mac_address(),
            identity_token: Uuid::new_v4().to_string(),
        }
    }

    /// The connect notification sent as the first tunnel frame.
    pub fn register_message(&self) -> ControlMessage {
        ControlMessage::Register {
            process_name: self.process_name.clone(),
            host: self.host.clone(),
            mac: self.mac.clone(),
            identity_token: self.identity_token.clone(),
        }
    }
}

fn default_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}
