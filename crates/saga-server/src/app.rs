//! Router assembly.

use crate::routes;
use crate::state::AppState;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

/// `/api/*` REST routes, the `/ws` observer endpoint and static files.
pub fn router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/sessions", get(routes::sessions::list))
        .route("/sessions/{name}", get(routes::sessions::get))
        .route("/health", get(routes::health));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(routes::ws::upgrade))
        .fallback_service(ServeDir::new(&state.config.static_dir))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
