//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **CLI flags** — applied by `main` after loading
//! 2. **Environment variables** — `RELAYTERM_WEB_LISTEN`,
//!    `RELAYTERM_RPC_LISTEN`, `RELAYTERM_WORKER_NAME`,
//!    `RELAYTERM_ROUTER_URL`, `RELAYTERM_WORKER_KEY`
//! 3. **Config file** — path via `--config <path>`, or `relayterm.toml` in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [router]
//! web_listen = "0.0.0.0:8080"        # browsers: dashboard, /director, /terminal
//! rpc_listen = "0.0.0.0:8081"        # workers: /rpc/worker
//! heartbeat_timeout_secs = 90
//! sweep_interval_secs = 30
//! worker_key = "shared-secret"       # optional
//! ssl_cert = "/etc/relayterm/cert.pem" # both set: TLS on both listeners
//! ssl_key = "/etc/relayterm/key.pem"
//!
//! [worker]
//! name = "build-box"                 # default: worker-<8 hex>
//! router_url = "ws://127.0.0.1:8081/rpc/worker"
//! reconnect_delay_secs = 1
//! reconnect_max_delay_secs = 60
//! heartbeat_interval_secs = 30
//! worker_key = "shared-secret"
//! ssl_cert = "/etc/relayterm/cert.pem" # trusted when dialing wss://
//!
//! [pty]
//! shell = "/bin/bash"                # default: $SHELL, then sh
//! max_chunk_size = 4096
//! stop_grace_ms = 2000
//! default_rows = 24
//! default_cols = 80
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::shell::{self, session::SpawnOptions};

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "relayterm.toml";

/// Router RPC address a worker dials when only `--rpc-host`/`--rpc-port` are given.
pub const DEFAULT_RPC_ADDR: &str = "127.0.0.1:8081";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub pty: PtyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Router listeners and worker liveness.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Browser-facing listener (default `0.0.0.0:8080`).
    #[serde(default = "default_web_listen")]
    pub web_listen: String,
    /// Worker-facing listener (default `0.0.0.0:8081`).
    #[serde(default = "default_rpc_listen")]
    pub rpc_listen: String,
    /// Seconds without a ping before a worker is considered gone (default 90).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds between dead-worker sweeps (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Shared secret workers must present as `?token=`. Unset = open.
    pub worker_key: Option<String>,
    /// PEM certificate chain. With `ssl_key`, both listeners speak TLS.
    pub ssl_cert: Option<String>,
    /// PEM private key for `ssl_cert`.
    pub ssl_key: Option<String>,
}

/// Worker identity and tunnel behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Process name shown on the dashboard. Generated when unset.
    pub name: Option<String>,
    /// Router RPC endpoint (default `ws://127.0.0.1:8081/rpc/worker`).
    #[serde(default = "default_router_url")]
    pub router_url: String,
    /// Initial reconnect backoff in seconds (default 1).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Backoff ceiling in seconds (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Seconds between pings (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Must match the router's `worker_key` when that is set.
    pub worker_key: Option<String>,
    /// PEM certificate trusted when dialing the router.
    pub ssl_cert: Option<String>,
    /// Private key presented with `ssl_cert` as the client identity.
    pub ssl_key: Option<String>,
}

/// Shell and PTY settings for worker sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct PtyConfig {
    /// Shell binary. Falls back to `$SHELL`, then `sh`.
    pub shell: Option<String>,
    /// Largest output chunk read from a PTY in one go (default 4096).
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Wait between stop escalation steps in milliseconds (default 2000).
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Window rows when the worker has no terminal of its own (default 24).
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Window columns when the worker has no terminal of its own (default 80).
    #[serde(default = "default_cols")]
    pub default_cols: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_web_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_rpc_listen() -> String {
    "0.0.0.0:8081".to_string()
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_router_url() -> String {
    "ws://127.0.0.1:8081/rpc/worker".to_string()
}
fn default_reconnect_delay() -> u64 {
    1
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_max_chunk_size() -> usize {
    4096
}
fn default_stop_grace_ms() -> u64 {
    2000
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            web_listen: default_web_listen(),
            rpc_listen: default_rpc_listen(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            worker_key: None,
            ssl_cert: None,
            ssl_key: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            router_url: default_router_url(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            worker_key: None,
            ssl_cert: None,
            ssl_key: None,
        }
    }
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            shell: None,
            max_chunk_size: default_max_chunk_size(),
            stop_grace_ms: default_stop_grace_ms(),
            default_rows: default_rows(),
            default_cols: default_cols(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl PtyConfig {
    /// Spawn parameters for new PTY sessions.
    pub fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            shell: shell::resolve_shell(self.shell.as_deref()),
            max_chunk: self.max_chunk_size,
            rows: self.default_rows,
            cols: self.default_cols,
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `relayterm.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Env var overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("RELAYTERM_WEB_LISTEN") {
            self.router.web_listen = listen;
        }
        if let Some(listen) = lookup("RELAYTERM_RPC_LISTEN") {
            self.router.rpc_listen = listen;
        }
        if let Some(name) = lookup("RELAYTERM_WORKER_NAME") {
            self.worker.name = Some(name);
        }
        if let Some(url) = lookup("RELAYTERM_ROUTER_URL") {
            self.worker.router_url = url;
        }
        if let Some(key) = lookup("RELAYTERM_WORKER_KEY") {
            self.router.worker_key = Some(key.clone());
            self.worker.worker_key = Some(key);
        }
    }
}
