//! # routes::bridge
//!
//! `POST /api/bridge/fills` — the exchange bridge pushes streaming fill
//! notifications here. Accepts one update or an array; each is fanned out to every
//! Fill Waiter listening on that contract.

use axum::{extract::State, response::IntoResponse, Json};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

use crate::error::AppError;
use crate::models::FillUpdate;
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FillPayload {
    One(FillUpdate),
    Many(Vec<FillUpdate>),
}

impl FillPayload {
    fn into_vec(self) -> Vec<FillUpdate> {
        match self {
            FillPayload::One(update) => vec![update],
            FillPayload::Many(updates) => updates,
        }
    }
}

fn validate(update: &FillUpdate) -> Result<(), AppError> {
    if update.contract_id.trim().is_empty() {
        return Err(AppError::BadRequest(format!("order {}: contract_id is empty", update.order_id)));
    }
    if update.order_id.as_str().trim().is_empty() {
        return Err(AppError::BadRequest("order_id is empty".into()));
    }
    if update.filled_quantity < Decimal::ZERO {
        return Err(AppError::BadRequest(format!(
            "order {}: negative filled_quantity {}",
            update.order_id, update.filled_quantity
        )));
    }
    Ok(())
}

/// POST /api/bridge/fills
pub async fn receive_fills(
    State(state): State<SharedState>,
    Json(payload): Json<FillPayload>,
) -> Result<impl IntoResponse, AppError> {
    let updates = payload.into_vec();
    updates.iter().try_for_each(validate)?;

    let mut delivered = 0usize;
    for update in updates.iter() {
        info!(
            order_id = %update.order_id,
            contract_id = %update.contract_id,
            status = ?update.status,
            filled = %update.filled_quantity,
            "📥 Fill notification from bridge"
        );
        match state.fills_tx.send(update.clone()) {
            Ok(receivers) => delivered = delivered.max(receivers),
            // Nobody waiting on a fill right now; the poll side still covers it.
            Err(_) => debug!(order_id = %update.order_id, "No fill listeners"),
        }
    }
    state.fills_received.fetch_add(updates.len() as u64, Ordering::Relaxed);

    Ok(Json(json!({
        "ok":        true,
        "accepted":  updates.len(),
        "listeners": delivered,
    })))
}
