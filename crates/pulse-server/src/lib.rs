//! Pulse server library logic.

pub mod api;
pub mod api_ws;
pub mod bus;
pub mod config;
pub mod producer;
pub mod registry;
pub mod service;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use bus::EventBus;
use config::BroadcastConfig;
use pulse_store::MetricStore;
use registry::ConnectionRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Persistent metric history.
    pub store: Arc<dyn MetricStore>,
    /// Fan-out of newly persisted records.
    pub bus: EventBus,
    /// Live observer connections. Same registry the bus delivers to.
    pub registry: ConnectionRegistry,
    /// Per-connection queue and write limits.
    pub broadcast: BroadcastConfig,
}

impl AppState {
    /// Wires a store to a fresh registry and bus.
    pub fn new(store: Arc<dyn MetricStore>, broadcast: BroadcastConfig) -> Self {
        let registry = ConnectionRegistry::new();
        let bus = EventBus::new(registry.clone());
        Self {
            store,
            bus,
            registry,
            broadcast,
        }
    }
}

/// Maximum request body size (64 KiB).
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .route("/api/metrics", post(api::ingest_metric_handler))
        .route(
            "/api/metrics/{subjectId}/recent",
            get(api::recent_metrics_handler),
        )
        .route(
            "/api/metrics/{subjectId}/latest",
            get(api::latest_metric_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
