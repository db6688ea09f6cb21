#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! relayterm library — browser terminals for remote workers.
//!
//! Modules:
//! - `protocol` — DATA/RESIZE/STOP command frames
//! - `shell` — PTY allocation and [`shell::session::PtySession`]
//! - `worker` — worker identity and the session multiplexer
//! - `registry` — worker identity registry (duplicate-name policy)
//! - `director` — roster fan-out to dashboards
//! - `tunnel` — worker ↔ router WebSocket tunnel (client and relay)
//! - `ws` — browser `/director` and `/terminal` sockets
//! - `routes` — dashboard assets and `/api/health`
//! - `config` — TOML + env-var configuration
//! - `tls` — router listener TLS and the worker's TLS connector

pub mod auth;
pub mod config;
pub mod director;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod shell;
pub mod state;
pub mod tls;
pub mod tunnel;
pub mod worker;
pub mod ws;

pub use config::Config;
pub use director::DirectorBus;
pub use registry::WorkerRegistry;
pub use state::RouterState;
pub use tunnel::relay::RelayState;
