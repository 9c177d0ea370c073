//! HTTP / WebSocket operations surface.

pub mod bridge;
pub mod monitor;
pub mod ops;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::{require_api_key, HEALTH_PATH};
use crate::state::SharedState;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Ops ───────────────────────────────────────────────────────────────
        .route(HEALTH_PATH,                    get(ops::health_check))
        .route("/api/guard/halt",              post(ops::halt))
        .route("/api/guard/emergency-close",   post(ops::emergency_close))
        // ── Monitor ───────────────────────────────────────────────────────────
        .route("/api/guard/status",            get(monitor::get_status))
        .route("/api/guard/history",           get(monitor::get_history))
        .route("/ws/monitor",                  get(monitor::ws_monitor))
        // ── Exchange bridge ───────────────────────────────────────────────────
        .route("/api/bridge/fills",            post(bridge::receive_fills))
        // ── Middleware ────────────────────────────────────────────────────────
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
