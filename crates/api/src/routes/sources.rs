use axum::{
    extract::{Path, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::debug;

use common::{Direction, Outcome, SourceKey};
use engine::{Ingest, SelectionState};

use crate::{auth::require_auth, ApiError, AppState};

pub fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/sources", get(list_sources))
        .route("/api/sources/:symbol/:direction/:source", get(get_source))
        .route(
            "/api/sources/:symbol/:direction/:source/config",
            get(get_config),
        )
        .route("/api/outcomes", post(post_outcome))
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

fn parse_key((symbol, direction, source): (String, String, String)) -> Result<SourceKey, ApiError> {
    let direction: Direction = direction
        .parse()
        .map_err(|e: common::Error| ApiError::BadRequest(e.to_string()))?;
    Ok(SourceKey::new(symbol, direction, source))
}

// ─── Sources ──────────────────────────────────────────────────────────────────

async fn list_sources(State(state): State<AppState>) -> Json<Value> {
    let sources: Vec<Value> = state
        .handle
        .snapshots()
        .await
        .iter()
        .map(|s| {
            json!({
                "key": s.key,
                "phase": s.phase,
                "version": s.version,
                "candidates": s.candidates.len(),
                "has_edge": s.assessment.as_ref().map(|a| a.has_edge),
                "live_win_rate": s.live_win_rate(),
                "updated_at": s.updated_at,
            })
        })
        .collect();
    Json(json!({ "total": sources.len(), "sources": sources }))
}

async fn get_source(
    State(state): State<AppState>,
    Path(path): Path<(String, String, String)>,
) -> Result<Json<SelectionState>, ApiError> {
    let key = parse_key(path)?;
    state
        .handle
        .snapshot(&key)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no state for {key}")))
}

// ─── Selection ────────────────────────────────────────────────────────────────

/// Configuration for the next signal. Keys that are not Live get `null`,
/// meaning the signal source's own defaults apply.
async fn get_config(
    State(state): State<AppState>,
    Path(path): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    let key = parse_key(path)?;
    let selection = state.handle.select_config(&key).await?;
    let phase = state.handle.phase(&key).await;
    Ok(Json(json!({
        "key": key,
        "phase": phase,
        "selection": selection,
    })))
}

// ─── Outcomes ─────────────────────────────────────────────────────────────────

async fn post_outcome(
    State(state): State<AppState>,
    Json(outcome): Json<Outcome>,
) -> Result<Json<Ingest>, ApiError> {
    if outcome.outcome_id.trim().is_empty() {
        return Err(ApiError::BadRequest("outcome_id must not be empty".into()));
    }
    if !outcome.realized_pnl_pct.is_finite() {
        return Err(ApiError::BadRequest("realized_pnl_pct must be finite".into()));
    }
    if outcome.closed_at < outcome.opened_at {
        return Err(ApiError::BadRequest("closed_at precedes opened_at".into()));
    }
    debug!(outcome_id = %outcome.outcome_id, key = %outcome.key, "Outcome received");
    let ingest = state.handle.submit_outcome(outcome).await?;
    Ok(Json(ingest))
}
