use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use common::Phase;

use crate::AppState;

pub fn health_router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz))
}

/// Health check endpoint, no auth required.
async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let snapshots = state.handle.snapshots().await;
    let count = |phase: Phase| snapshots.iter().filter(|s| s.phase == phase).count();
    Json(json!({
        "status": "ok",
        "keys": snapshots.len(),
        "baseline": count(Phase::Baseline),
        "optimizing": count(Phase::Optimizing),
        "live": count(Phase::Live),
    }))
}
