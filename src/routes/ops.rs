//! # routes::ops
//!
//! | Method | Path                          | Description                         |
//! |--------|-------------------------------|-------------------------------------|
//! | GET    | `/api/health`                 | liveness (no auth)                  |
//! | POST   | `/api/guard/halt`             | manual halt                         |
//! | POST   | `/api/guard/emergency-close`  | halt, then flatten by measured size |

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::engine::{self, CloseOutcome};
use crate::error::AppError;
use crate::models::{HaltCause, HaltReason};
use crate::state::SharedState;

/// GET /api/health
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "ok":      true,
        "service": "fillguard",
        "halted":  state.risk.is_halted(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct HaltBody {
    pub reason: Option<String>,
}

/// POST /api/guard/halt — stops the loop from issuing any further order
pub async fn halt(
    State(state): State<SharedState>,
    body: Option<Json<HaltBody>>,
) -> impl IntoResponse {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "Manual halt via API".to_string());

    let newly = state.risk.halt(HaltReason::new(HaltCause::Manual, reason.clone()));

    Json(json!({
        "ok":          true,
        "newly":       newly,
        "halt_reason": state.risk.halt_reason(),
        "message":     format!("Guard halted: {reason}"),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct EmergencyCloseBody {
    pub contract_id: Option<String>,
}

/// POST /api/guard/emergency-close
///
/// Halts first so the loop cannot trade against the close.
pub async fn emergency_close(
    State(state): State<SharedState>,
    body: Option<Json<EmergencyCloseBody>>,
) -> Result<impl IntoResponse, AppError> {
    let contract_id = body
        .and_then(|Json(b)| b.contract_id)
        .unwrap_or_else(|| state.config.contract_id.clone());
    if contract_id.trim().is_empty() {
        return Err(AppError::BadRequest("contract_id must not be empty".into()));
    }

    state.risk.halt(HaltReason::new(
        HaltCause::Manual,
        format!("emergency close requested for {contract_id}"),
    ));

    let outcome = engine::emergency_close(
        state.exchange.clone(),
        &state.config,
        &contract_id,
        state.events(),
    )
    .await;

    let status = match &outcome {
        CloseOutcome::Closed => StatusCode::OK,
        other => {
            warn!(contract_id, outcome = ?other, "Emergency close did not flatten");
            StatusCode::BAD_GATEWAY
        }
    };

    Ok((
        status,
        Json(json!({
            "ok":          outcome.is_closed(),
            "contract_id": contract_id,
            "outcome":     outcome,
        })),
    ))
}
