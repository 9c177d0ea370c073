//! # error
//!
//! Error types of the guard.
//!
//! [`GuardError`] is the failure taxonomy the engine reasons about: transient I/O,
//! ambiguous fill state, uncancelable orders and residual positions are handled
//! differently by the controller, so they are distinct variants rather than strings.
//!
//! [`AppError`] is what HTTP handlers return. Axum's `IntoResponse` impl converts it
//! into a structured JSON body so the operator always gets a machine-readable answer.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

use crate::exchange::ExchangeError;
use crate::models::OrderId;

#[derive(Debug, Error)]
pub enum GuardError {
    /// A single exchange call kept failing with network/timeout errors.
    #[error("{op} failed after {attempts} attempts: {source}")]
    TransientIo {
        op:       &'static str,
        attempts: u32,
        #[source]
        source:   ExchangeError,
    },

    /// Stream and poll evidence still disagree after the wait expired.
    #[error("ambiguous fill state for order {order_id}: {detail}")]
    AmbiguousState { order_id: OrderId, detail: String },

    /// Orders that survived every cancellation attempt.
    #[error("uncancelable orders on {contract_id}: {order_ids:?}")]
    UncancelableOrders {
        contract_id: String,
        order_ids:   Vec<OrderId>,
    },

    /// Close retries exhausted with the position still open.
    #[error("residual position {residual} on {contract_id} after close retries")]
    ResidualPosition { contract_id: String, residual: Decimal },

    /// Non-transient exchange failure (rejection, bad payload, ...).
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

// ─── HTTP ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The engine failed while talking to the exchange.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Guard(_)      => StatusCode::BAD_GATEWAY,
            AppError::Internal(_)   => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "ok":    false,
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
