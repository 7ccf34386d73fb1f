//! API layer -- axum routes, handlers, and middleware.

pub mod ingest;
mod routes;
pub mod state;

use self::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;

/// Build the application router with all API routes.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .merge(routes::otlp_routes())
        .fallback(fallback)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(RequestDecompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
