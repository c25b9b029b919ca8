use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", axum::routing::post(handlers::submit_job))
        .route("/jobs/:id", get(handlers::get_job).delete(handlers::cancel_job))
        .route("/languages", get(handlers::list_languages))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_text))
        .layer(TraceLayer::new_for_http())
}
