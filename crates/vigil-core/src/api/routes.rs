//! API routes

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{self, AppState};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))

        // Alert state
        .route("/api/alerts", get(handlers::list_alerts))
        .route(
            "/api/alerts/:key",
            get(handlers::get_alert).delete(handlers::purge_alert),
        )
        .route("/api/alerts/:key/ack", post(handlers::acknowledge_alert))
        .route("/api/check", post(handlers::run_check))

        // Silences
        .route(
            "/api/silences",
            get(handlers::list_silences).post(handlers::create_silence),
        )
        .route("/api/silences/:id", axum::routing::delete(handlers::clear_silence))

        // Expressions
        .route("/api/expr", post(handlers::evaluate_expr))

        .with_state(state)
}
