//! Worker identity registry.
//!
//! [`WorkerRegistry`] is the router's single source of truth for which workers
//! exist and whether a connection attempt is accepted. Records are keyed by
//! process name and kept in first-connect order. They are never deleted
//! automatically; a director may remove a stale (inactive) one.
//!
//! ## Name collisions
//!
//! Each worker process generates an identity token once at startup. On
//! connect:
//!
//! | Existing record         | Token     | Result                                   |
//! |-------------------------|-----------|------------------------------------------|
//! | none                    | —         | insert, active                           |
//! | any                     | same      | update host/mac, active (reconnect)      |
//! | active                  | different | existing → inactive, **reject** newcomer |
//! | inactive                | different | replace, active                          |
//!
//! The newcomer loses a collision against a live record even if it is the
//! restarted "real" process; it is expected to exit, and the now-inactive
//! name can be claimed by the next attempt.
//!
//! ## Concurrency
//!
//! All mutations hold one async mutex for the lookup, the decision, the write
//! and the roster publish, so concurrent connects for a name are serialized
//! and directors see snapshots in mutation order.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::director::DirectorBus;

/// One worker known to the router. Serialized as a roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub host: String,
    pub mac: String,
    pub process_name: String,
    #[serde(rename = "id")]
    pub identity_token: String,
    pub active: bool,
}

/// Metadata carried by a connect notification.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub process_name: String,
    pub host: String,
    pub mac: String,
    pub identity_token: String,
}

/// How an accepted connect was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// First time this name was seen.
    Registered,
    /// Same process instance coming back.
    Reconnected,
    /// A new process took over an inactive name.
    Superseded,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A different live process already owns the name.
    #[error("worker name {process_name:?} is already owned by another active process")]
    DuplicateIdentity { process_name: String },
}

/// Cloneable — all clones share the same records.
#[derive(Clone)]
pub struct WorkerRegistry {
    workers: Arc<Mutex<IndexMap<String, Worker>>>,
    bus: DirectorBus,
}

impl WorkerRegistry {
    pub fn new(bus: DirectorBus) -> Self {
        Self {
            workers: Arc::new(Mutex::new(IndexMap::new())),
            bus,
        }
    }

    /// Handle a connect notification.
    pub async fn connect(&self, req: ConnectRequest) -> Result<ConnectOutcome, RegistryError> {
        let mut workers = self.workers.lock().await;

        let outcome = match workers.get_mut(&req.process_name) {
            None => ConnectOutcome::Registered,
            Some(existing) if existing.identity_token == req.identity_token => {
                existing.host = req.host;
                existing.mac = req.mac;
                existing.active = true;
                info!(worker = %req.process_name, "Worker reconnected");
                self.bus.publish(workers.values().cloned().collect()).await;
                return Ok(ConnectOutcome::Reconnected);
            }
            Some(existing) if existing.active => {
                existing.active = false;
                warn!(
                    worker = %req.process_name,
                    "Duplicate worker name from a different process; rejecting it and marking the existing record inactive"
                );
                self.bus.publish(workers.values().cloned().collect()).await;
                return Err(RegistryError::DuplicateIdentity {
                    process_name: req.process_name,
                });
            }
            Some(_) => ConnectOutcome::Superseded,
        };

        let name = req.process_name.clone();
        workers.insert(
            req.process_name.clone(),
            Worker {
                host: req.host,
                mac: req.mac,
                process_name: req.process_name,
                identity_token: req.identity_token,
                active: true,
            },
        );
        match outcome {
            ConnectOutcome::Superseded => info!(worker = %name, "Worker replaced stale record"),
            _ => info!(worker = %name, "Worker connected"),
        }
        self.bus.publish(workers.values().cloned().collect()).await;
        Ok(outcome)
    }

    /// Handle a disconnect notification. Unknown names are ignored.
    pub async fn disconnect(&self, process_name: &str) -> bool {
        let mut workers = self.workers.lock().await;
        let Some(worker) = workers.get_mut(process_name) else {
            return false;
        };
        worker.active = false;
        info!(worker = %process_name, "Worker disconnected");
        self.bus.publish(workers.values().cloned().collect()).await;
        true
    }

    /// Forget an inactive worker. Active workers are kept.
    pub async fn remove(&self, process_name: &str) -> bool {
        let mut workers = self.workers.lock().await;
        match workers.get(process_name) {
            None => false,
            Some(worker) if worker.active => {
                warn!(worker = %process_name, "Refusing to remove an active worker");
                false
            }
            Some(_) => {
                workers.shift_remove(process_name);
                info!(worker = %process_name, "Worker record removed");
                self.bus.publish(workers.values().cloned().collect()).await;
                true
            }
        }
    }

    /// Full roster in first-connect order.
    pub async fn roster(&self) -> Vec<Worker> {
        self.workers.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, process_name: &str) -> Option<Worker> {
        self.workers.lock().await.get(process_name).cloned()
    }

    pub async fn is_active(&self, process_name: &str) -> bool {
        self.workers
            .lock()
            .await
            .get(process_name)
            .is_some_and(|w| w.active)
    }
}
