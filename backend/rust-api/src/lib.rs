use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        // Public endpoints (no auth required)
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        // Protected endpoints (require JWT)
        .nest(
            "/pair-game-quiz",
            duel_routes().layer(middleware::from_fn_with_state(
                app_state.clone(),
                middlewares::auth::auth_middleware,
            )),
        )
        .with_state(app_state)
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn duel_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/pairs/connection", post(handlers::duels::connect))
        .route("/pairs/my-current", get(handlers::duels::my_current))
        .route(
            "/pairs/my-current/answers",
            post(handlers::duels::submit_answer),
        )
        .route("/pairs/my", get(handlers::duels::my_pairs))
        .route("/pairs/{id}", get(handlers::duels::get_pair))
        .route("/users/my-statistic", get(handlers::duels::my_statistic))
}
