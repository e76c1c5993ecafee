use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{handlers, middleware::metrics_middleware, tasks};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Health, config and metrics
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        .route("/metrics", get(handlers::metrics))
        // Tasks
        .route(
            "/tasks",
            get(tasks::list_tasks)
                .post(tasks::submit_task)
                .delete(tasks::purge_tasks),
        )
        .route("/tasks/replay", post(tasks::replay_failed))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/republish", post(tasks::republish_task))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
}
