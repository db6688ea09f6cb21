//! HTTP route handlers on the web listener.
//!
//! - [`index`] — the embedded dashboard page and its script.
//! - [`health`] — unauthenticated liveness check.

pub mod health;
pub mod index;

use axum::{routing::get, Router};

use crate::state::RouterState;

/// Plain HTTP routes for the web listener.
pub fn router() -> Router<RouterState> {
    Router::new()
        .route("/", get(index::index))
        .route("/static/js/main.js", get(index::main_js))
        .route("/api/health", get(health::health))
}
