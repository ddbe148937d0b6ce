//! HTTP surface: the collector's metric ingest, the operator console
//! websocket, and the static console assets.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use tideway_qos::SessionRegistry;

pub mod console;
pub mod metric;

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Mutex<SessionRegistry>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metric_post", post(metric::metric_post))
        .route("/console_websocket", get(console::console_websocket))
        .fallback_service(ServeDir::new("static"))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
