//! HTTP relay server
//!
//! Wires viewer requests to the stream registry and dashboard clients to the
//! event broadcaster. Three routes: the MJPEG relay, the change-event
//! WebSocket, and a liveness summary.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::hub::EventBroadcaster;
use crate::relay::StreamRegistry;

pub mod stream;
pub mod ws;

/// Shared handles every route needs
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    pub hub: Arc<EventBroadcaster>,
}

/// Build the relay router over the given state
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(stream::stream_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        // Dashboard is served from another origin
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router until the process exits
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, build_router(state)).await
}

/// Liveness summary: active streams and connected dashboard clients
async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "streams": state.registry.session_count(),
        "clients": state.hub.client_count().await,
    }))
}
