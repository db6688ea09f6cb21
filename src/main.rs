#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # relayterm
//!
//! Browser access to shells running on remote workers.
//!
//! A router process serves a dashboard and browser WebSockets on its web
//! listener, and accepts worker tunnels on its RPC listener. Each worker
//! dials the router, registers under a process name and hosts one PTY-backed
//! shell per browser terminal.
//!
//! ## Subcommands
//!
//! - `relayterm start-router` — run the router (web + RPC listeners)
//! - `relayterm start-worker` — run a worker and dial the router
//!
//! ## API surface (web listener)
//!
//! | Method | Path                               | Description                     |
//! |--------|------------------------------------|---------------------------------|
//! | GET    | `/`                                | Dashboard page                  |
//! | GET    | `/static/js/main.js`               | Dashboard script                |
//! | GET    | `/api/health`                      | Liveness check + counters       |
//! | GET    | `/director`                        | WS: live worker roster          |
//! | GET    | `/terminal?worker_id=<name>`       | WS: one terminal session        |
//!
//! ## RPC listener
//!
//! | Method | Path                    | Auth                  | Description           |
//! |--------|-------------------------|-----------------------|-----------------------|
//! | GET    | `/rpc/worker`           | `?token=<worker_key>` | Worker tunnel (WS)    |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, listeners, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! tls.rs           — listener TLS (rustls) and worker connector (native-tls)
//! protocol.rs      — DATA / RESIZE / STOP command frames
//! registry.rs      — worker identity registry
//! director.rs      — roster fan-out to dashboards
//! shell/
//!   pty.rs         — PTY allocation, spawn, resize
//!   session.rs     — PtySession (spawn, input, output, stop)
//! worker/
//!   mod.rs         — WorkerIdentity
//!   machine.rs     — hostname and MAC discovery
//!   multiplexer.rs — session id → PTY session bridge
//! tunnel/
//!   mod.rs         — control messages and stream frames
//!   client.rs      — worker side: dial, register, reconnect
//!   relay.rs       — router side: accept workers, route session frames
//! ws/
//!   director.rs    — /director
//!   terminal.rs    — /terminal
//! routes/
//!   index.rs       — embedded dashboard
//!   health.rs      — GET /api/health
//! ```

use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use relayterm::config::{self, Config};
use relayterm::tunnel::{client, relay};
use relayterm::worker::multiplexer::SessionMultiplexer;
use relayterm::worker::WorkerIdentity;
use relayterm::{routes, tls, ws, RouterState};

/// Browser access to shells running on remote workers.
#[derive(Parser)]
#[command(name = "relayterm", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router: dashboard, browser sockets and the worker endpoint.
    StartRouter {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Host for the worker (RPC) listener.
        #[arg(long)]
        rpc_host: Option<String>,
        /// Port for the worker (RPC) listener.
        #[arg(long)]
        rpc_port: Option<u16>,
        /// Host for the web listener.
        #[arg(long)]
        web_host: Option<String>,
        /// Port for the web listener.
        #[arg(long)]
        web_port: Option<u16>,
        /// PEM certificate chain; with `--ssl-key`, both listeners use TLS.
        #[arg(long)]
        ssl_cert: Option<String>,
        /// PEM private key for `--ssl-cert`.
        #[arg(long)]
        ssl_key: Option<String>,
    },
    /// Run a worker that hosts shells for the router.
    StartWorker {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Process name to register under (default: generated).
        #[arg(long)]
        name: Option<String>,
        /// Router RPC host.
        #[arg(long, conflicts_with = "router_url")]
        rpc_host: Option<String>,
        /// Router RPC port.
        #[arg(long, conflicts_with = "router_url")]
        rpc_port: Option<u16>,
        /// Full worker endpoint URL, e.g. `wss://router.example/rpc/worker`.
        #[arg(long)]
        router_url: Option<String>,
        /// PEM certificate to trust for the router (switches `--rpc-host` to `wss://`).
        #[arg(long)]
        ssl_cert: Option<String>,
        /// PEM private key presented with `--ssl-cert` as the client identity.
        #[arg(long)]
        ssl_key: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::StartRouter {
            config,
            rpc_host,
            rpc_port,
            web_host,
            web_port,
            ssl_cert,
            ssl_key,
        } => {
            let Some(mut config) = load_config(config.as_deref()) else {
                std::process::exit(2);
            };
            config.router.rpc_listen =
                override_addr(&config.router.rpc_listen, rpc_host.as_deref(), rpc_port);
            config.router.web_listen =
                override_addr(&config.router.web_listen, web_host.as_deref(), web_port);
            config.router.ssl_cert = ssl_cert.or(config.router.ssl_cert);
            config.router.ssl_key = ssl_key.or(config.router.ssl_key);
            run_router(config).await
        }
        Commands::StartWorker {
            config,
            name,
            rpc_host,
            rpc_port,
            router_url,
            ssl_cert,
            ssl_key,
        } => {
            let Some(mut config) = load_config(config.as_deref()) else {
                std::process::exit(2);
            };
            if name.is_some() {
                config.worker.name = name;
            }
            config.worker.ssl_cert = ssl_cert.or(config.worker.ssl_cert);
            config.worker.ssl_key = ssl_key.or(config.worker.ssl_key);
            if let Some(url) = router_url {
                config.worker.router_url = url;
            } else if rpc_host.is_some() || rpc_port.is_some() {
                let addr = override_addr(config::DEFAULT_RPC_ADDR, rpc_host.as_deref(), rpc_port);
                let scheme = if config.worker.ssl_cert.is_some() { "wss" } else { "ws" };
                config.worker.router_url = format!("{scheme}://{addr}/rpc/worker");
            }
            run_worker(config).await
        }
    };
    std::process::exit(code);
}

/// Load config and initialize tracing. Errors are printed to stderr since
/// the subscriber's level comes from the config itself.
fn load_config(path: Option<&str>) -> Option<Config> {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("relayterm: {e}");
            return None;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    Some(config)
}

/// Replace the host and/or port of a `host:port` listen address.
fn override_addr(current: &str, host: Option<&str>, port: Option<u16>) -> String {
    let (cur_host, cur_port) = current.rsplit_once(':').unwrap_or((current, ""));
    let host = host.unwrap_or(cur_host);
    match port {
        Some(port) => format!("{host}:{port}"),
        None => format!("{host}:{cur_port}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

async fn run_router(config: Config) -> i32 {
    info!("relayterm v{} starting router", env!("CARGO_PKG_VERSION"));
    if config.router.worker_key.is_none() {
        warn!("No worker_key set — any process can register as a worker");
    }

    let tls_config = match tls::server_config(
        config.router.ssl_cert.as_deref(),
        config.router.ssl_key.as_deref(),
    )
    .await
    {
        Ok(tls_config) => tls_config,
        Err(e) => {
            error!("{e}");
            return if e.is_config() { 2 } else { 1 };
        }
    };

    let sweep_secs = config.router.sweep_interval_secs.max(1);
    let state = RouterState::new(config);

    let web_app = Router::new()
        .merge(routes::router())
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());
    let rpc_app = relay::relay_router(state.relay.clone()).layer(TraceLayer::new_for_http());

    let web_listener = match TcpListener::bind(&state.config.router.web_listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind web listener {}: {e}", state.config.router.web_listen);
            return 1;
        }
    };
    let rpc_listener = match TcpListener::bind(&state.config.router.rpc_listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind RPC listener {}: {e}", state.config.router.rpc_listen);
            return 1;
        }
    };
    let scheme = if tls_config.is_some() { "https" } else { "http" };
    info!("Web listening on {scheme}://{}", state.config.router.web_listen);
    info!("Worker RPC listening on {scheme}://{}", state.config.router.rpc_listen);

    // Evict workers whose heartbeats stopped.
    let sweep_relay = state.relay.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(sweep_secs));
        loop {
            interval.tick().await;
            sweep_relay.sweep_dead_workers().await;
        }
    });

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let web_server = tokio::spawn(tls::serve(
        web_listener,
        web_app,
        tls_config.clone(),
        stop_rx.clone(),
    ));
    let rpc_server = tokio::spawn(tls::serve(rpc_listener, rpc_app, tls_config, stop_rx));

    info!("Router ready");
    shutdown_signal().await;

    info!("Shutting down...");
    sweep_task.abort();

    // Tell workers first; their tunnels would otherwise hold graceful shutdown open.
    info!("Notifying workers of router shutdown...");
    state.relay.broadcast_shutdown().await;
    state.relay.drain_all().await;
    let _ = stop_tx.send(true);

    let mut code = 0;
    for (name, server) in [("web", web_server), ("rpc", rpc_server)] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("{name} server error: {e}");
                code = 1;
            }
            Err(e) => {
                error!("{name} server task failed: {e}");
                code = 1;
            }
        }
    }
    info!("Goodbye");
    code
}

async fn run_worker(config: Config) -> i32 {
    let identity = WorkerIdentity::generate(config.worker.name.clone());
    info!(
        worker = %identity.process_name,
        host = %identity.host,
        mac = %identity.mac,
        "relayterm v{} starting worker",
        env!("CARGO_PKG_VERSION")
    );

    let mux = SessionMultiplexer::new(config.pty.spawn_options());
    let result = tokio::select! {
        result = client::run(identity, config.worker, mux.clone()) => result,
        () = shutdown_signal() => Ok(()),
    };
    mux.shutdown().await;

    match result {
        Ok(()) => {
            info!("Goodbye");
            0
        }
        Err(e) => {
            error!("Worker stopped: {e}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_addr_replaces_parts() {
        assert_eq!(override_addr("0.0.0.0:8080", None, None), "0.0.0.0:8080");
        assert_eq!(override_addr("0.0.0.0:8080", Some("127.0.0.1"), None), "127.0.0.1:8080");
        assert_eq!(override_addr("0.0.0.0:8080", None, Some(9000)), "0.0.0.0:9000");
    }

    #[test]
    fn cli_parses_both_subcommands() {
        let cli = Cli::try_parse_from(["relayterm", "start-router", "--web-port", "9000"]).unwrap();
        assert!(matches!(cli.command, Commands::StartRouter { web_port: Some(9000), .. }));

        let cli = Cli::try_parse_from(["relayterm", "start-worker", "--name", "alpha"]).unwrap();
        assert!(
            matches!(cli.command, Commands::StartWorker { name: Some(ref n), .. } if n == "alpha")
        );

        let cli = Cli::try_parse_from([
            "relayterm",
            "start-router",
            "--ssl-cert",
            "cert.pem",
            "--ssl-key",
            "key.pem",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::StartRouter { ssl_cert: Some(ref c), ssl_key: Some(ref k), .. }
                if c == "cert.pem" && k == "key.pem"
        ));
        let cli =
            Cli::try_parse_from(["relayterm", "start-worker", "--ssl-cert", "cert.pem"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::StartWorker { ssl_cert: Some(_), ssl_key: None, .. }
        ));

        assert!(Cli::try_parse_from([
            "relayterm",
            "start-worker",
            "--rpc-port",
            "1",
            "--router-url",
            "ws://x/rpc/worker"
        ])
        .is_err());
    }
}
