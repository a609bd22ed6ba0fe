/*!
The HTTP interface: an axum router over a shared [`TrainingService`]
*/
use crate::pipeline::TrainingService;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod error;
pub mod routes;

/// State shared by every handler
#[derive(Debug, Clone)]
pub struct AppState {
    /// The training and forecasting service
    pub service: Arc<TrainingService>,
}

impl AppState {
    /// Wrap a service
    pub fn new(service: Arc<TrainingService>) -> AppState {
        AppState { service }
    }
}

/// Build the router with permissive CORS and request tracing
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::liveness))
        .route("/api", get(routes::root))
        .route("/api/", get(routes::root))
        .route("/api/health", get(routes::health))
        .route("/api/available-intervals", get(routes::available_intervals))
        .route("/api/stock-data/{symbol}", get(routes::stock_data))
        .route("/api/train", post(routes::train))
        .route("/api/training-status/{symbol}", get(routes::training_status))
        .route("/api/predict", post(routes::predict))
        .route("/api/models", get(routes::list_models))
        .route("/api/models/{symbol}", axum::routing::delete(routes::delete_model))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
