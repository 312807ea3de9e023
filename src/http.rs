//! Operator-observable HTTP surface (spec §4.I, §4.M).
//!
//! Exposes `/healthz`, `/readyz`, and `/metrics`, grounded in
//! `services/server/src/lib.rs`'s `mod health { healthz, readyz }` nesting
//! and its axum router wiring. `/metrics` serialises the same
//! `telemetry::Snapshot` the log pipeline already emits, rather than
//! inventing a second representation.

use crate::role::Role;
use crate::telemetry::Snapshot;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

/// Shared state the HTTP surface reads; updated by the pipeline after each
/// stats snapshot and role transition. Kept separate from `Pipeline` and
/// `RoleController` themselves so the HTTP server never needs direct
/// mutable access to pipeline internals.
#[derive(Clone)]
pub struct TelemetryHandle {
    inner: Arc<RwLock<TelemetryState>>,
}

struct TelemetryState {
    snapshot: Snapshot,
    role: Role,
    ready: bool,
}

impl TelemetryHandle {
    pub fn new() -> Self {
        TelemetryHandle {
            inner: Arc::new(RwLock::new(TelemetryState {
                snapshot: Snapshot {
                    counters: crate::telemetry::Counters::default(),
                    read_query_rate: 0.0,
                    write_query_rate: 0.0,
                },
                role: Role::Standby,
                ready: false,
            })),
        }
    }

    pub async fn update(&self, snapshot: Snapshot, role: Role) {
        let mut state = self.inner.write().await;
        state.snapshot = snapshot;
        state.role = role;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.inner.write().await.ready = ready;
    }
}

impl Default for TelemetryHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_router(handle: TelemetryHandle) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn readyz(State(handle): State<TelemetryHandle>) -> impl IntoResponse {
    let state = handle.inner.read().await;
    if state.ready {
        (axum::http::StatusCode::OK, "ready")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(handle): State<TelemetryHandle>) -> impl IntoResponse {
    let state = handle.inner.read().await;
    let role_tag = match state.role {
        Role::Master => "master",
        Role::Standby => "standby",
    };
    Json(serde_json::json!({
        "role": role_tag,
        "counters": state.snapshot.counters,
        "read_query_rate": state.snapshot.read_query_rate,
        "write_query_rate": state.snapshot.write_query_rate,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readyz_reflects_the_handle_state() {
        let handle = TelemetryHandle::new();
        handle.set_ready(true).await;
        let state = handle.inner.read().await;
        assert!(state.ready);
    }

    #[tokio::test]
    async fn update_replaces_the_latest_snapshot_and_role() {
        let handle = TelemetryHandle::new();
        let mut counters = crate::telemetry::Counters::default();
        counters.writes.executed = 7;
        let snapshot = Snapshot {
            counters,
            read_query_rate: 1.5,
            write_query_rate: 2.5,
        };
        handle.update(snapshot, Role::Master).await;
        let state = handle.inner.read().await;
        assert_eq!(state.snapshot.counters.writes.executed, 7);
        assert_eq!(state.role, Role::Master);
    }
}
