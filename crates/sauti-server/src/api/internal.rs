//! Internal monitoring endpoints.

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/internal/pools", get(pool_stats))
        .route("/internal/sessions", get(session_stats))
}

async fn pool_stats(State(state): State<AppState>) -> Json<Value> {
    let stats = state.pools.detailed_stats().await;
    Json(json!({ "pools": stats }))
}

async fn session_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "active_sessions": state.session_count().await }))
}
