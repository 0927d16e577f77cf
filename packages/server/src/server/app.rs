//! Application setup and router wiring.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::kernel::ChatKernel;
use crate::server::routes::chat::{cancel_handler, events_handler, submit_handler};
use crate::server::routes::health::health_handler;
use crate::server::routes::stream::stream_handler;

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<ChatKernel>,
}

/// Build the axum router over a kernel.
pub fn build_router(kernel: Arc<ChatKernel>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/chat", post(submit_handler))
        .route("/chat/cancel", post(cancel_handler))
        .route("/chat/events", get(events_handler))
        .route("/chat/stream", get(stream_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { kernel })
}
