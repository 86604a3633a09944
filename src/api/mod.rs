//! HTTP surface: submit inputs and poll their status.

mod routes;

use std::sync::Arc;

use axum::Router as AxumRouter;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::pipeline::Router;
use crate::status::StatusService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub status: StatusService,
}

/// Build the axum router with every REST route.
pub fn api_routes(router: Arc<Router>, status: StatusService) -> AxumRouter {
    let state = AppState { router, status };

    AxumRouter::new()
        .route("/health", get(routes::health))
        .route("/process", post(routes::process))
        .route("/status/{task_id}", get(routes::get_status))
        .route("/history", get(routes::get_history))
        .route("/tasks", get(routes::list_tasks))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
