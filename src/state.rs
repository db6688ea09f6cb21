//! Shared router state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::director::DirectorBus;
use crate::registry::WorkerRegistry;
use crate::tunnel::relay::RelayState;

/// Shared application state for the router.
///
/// The registry and bus are owned here and constructed once at startup; the
/// relay holds a clone of the same registry.
#[derive(Clone)]
pub struct RouterState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the router started (for uptime calculation).
    pub start_time: Instant,
    /// Every worker that has ever connected.
    pub registry: WorkerRegistry,
    /// Roster fan-out to dashboards.
    pub bus: DirectorBus,
    /// Live worker tunnels and the sessions routed through them.
    pub relay: RelayState,
}

impl RouterState {
    pub fn new(config: Config) -> Self {
        let bus = DirectorBus::new();
        let registry = WorkerRegistry::new(bus.clone());
        let relay = RelayState::new(
            registry.clone(),
            config.router.worker_key.clone(),
            config.router.heartbeat_timeout_secs,
        );
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            bus,
            relay,
        }
    }
}
