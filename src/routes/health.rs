//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::RouterState;

/// `GET /api/health` — liveness check.
///
/// Returns status, uptime, version, and worker/session/director counts. No
/// authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<RouterState>) -> Json<Value> {
    let roster = state.registry.roster().await;
    let active_workers = roster.iter().filter(|w| w.active).count();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "workers": roster.len(),
        "active_workers": active_workers,
        "sessions": state.relay.session_count().await,
        "directors": state.bus.observer_count().await,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::ConnectRequest;

    #[tokio::test]
    async fn counts_workers_by_state() {
        let state = RouterState::new(Config::default());
        for (name, token) in [("alpha", "T1"), ("beta", "T2")] {
            state
                .registry
                .connect(ConnectRequest {
                    process_name: name.into(),
                    host: "box".into(),
                    mac: "aa:bb:cc:dd:ee:ff".into(),
                    identity_token: token.into(),
                })
                .await
                .unwrap();
        }
        state.registry.disconnect("beta").await;

        let Json(body) = health(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["workers"], 2);
        assert_eq!(body["active_workers"], 1);
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["directors"], 0);
    }
}
