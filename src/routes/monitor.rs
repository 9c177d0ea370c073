//! # routes::monitor
//!
//! | Method    | Path                  | Description                              |
//! |-----------|-----------------------|------------------------------------------|
//! | GET (WS)  | `/ws/monitor`         | real-time `GuardEvent` stream            |
//! | GET       | `/api/guard/status`   | halt state, retry budget, fill evidence  |
//! | GET       | `/api/guard/history`  | recent reconciliation cycles             |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use tracing::{debug, info};

use crate::state::SharedState;

const DEFAULT_HISTORY_LIMIT: usize = 50;

async fn status_body(state: &SharedState) -> Value {
    let risk     = state.risk.status().await;
    let evidence = state.evidence.read().await.snapshot();
    let (cycles_recorded, last_cycle) = {
        let history = state.history.read().await;
        (history.len(), history.recent(1).into_iter().next())
    };

    json!({
        "contract_id":     state.config.contract_id,
        "side":            state.config.side,
        "quantity":        state.config.quantity,
        "risk":            risk,
        "evidence":        evidence,
        "cycles_run":      last_cycle.as_ref().map(|c| c.cycle_no).unwrap_or(0),
        "cycles_recorded": cycles_recorded,
        "last_cycle":      last_cycle,
        "fills_received":  state.fills_received.load(Ordering::Relaxed),
        "started_at":      state.started_at,
    })
}

// ─── WebSocket Handler ────────────────────────────────────────────────────────

pub async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let mut rx = state.broadcast_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("🔌 WebSocket client connected");

    // ── Snapshot first ────────────────────────────────────────────────────────
    let mut snapshot = status_body(&state).await;
    snapshot["event"] = json!("SNAPSHOT");

    if sender.send(Message::Text(snapshot.to_string())).await.is_err() {
        return;
    }

    // ── Event Loop ────────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(json_str) => {
                        if sender.send(Message::Text(json_str)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("WS client lagged, skipped {n} events");
                    }
                    Err(_) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 WebSocket client disconnected");
}

// ─── REST ─────────────────────────────────────────────────────────────────────

/// GET /api/guard/status
pub async fn get_status(State(state): State<SharedState>) -> impl IntoResponse {
    let mut body = status_body(&state).await;
    body["ok"] = json!(true);
    Json(body)
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /api/guard/history?limit=N — newest first
pub async fn get_history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let cycles = state.history.read().await.recent(limit);
    Json(json!({
        "ok":     true,
        "count":  cycles.len(),
        "cycles": cycles,
    }))
}
