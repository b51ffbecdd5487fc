//! HTTP surface: WebSocket upgrade, OTA boundary, internal monitoring.

pub mod internal;
pub mod ota;

use axum::{extract::Request, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info_span;

use crate::session;
use crate::state::AppState;

/// Create the main router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
        )
    });

    let api_routes = Router::new()
        .merge(ota::router())
        .merge(internal::router());

    Router::new()
        .merge(session::router())
        .nest("/api", api_routes)
        .layer(trace_layer)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
