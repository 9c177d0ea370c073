//! # exchange::http
//!
//! **REST bridge client** — talks to the exchange gateway over HTTP/JSON.
//!
//! ## Bridge API Contract
//! ```text
//! GET    /positions/{contract}      → { "contract_id": "...", "quantity": "-0.2" }
//! GET    /orders?contract={id}      → [OrderSnapshot, ...]   (active only)
//! GET    /orders/{order_id}         → OrderSnapshot | 404
//! POST   /orders                    → { "order_id": "..." } | 4xx { "error": "..." }
//! DELETE /orders/{order_id}         → 200 | 404 / 409 when already filled or gone
//! GET    /bbo/{contract}            → { "bid": "...", "ask": "..." }
//! ```
//! Fill notifications flow the other way: the bridge POSTs them to
//! `/api/bridge/fills`, and they reach [`HttpExchange::subscribe_fills`] through the
//! shared broadcast channel.

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::exchange::{Exchange, ExchangeError, FillSubscription};
use crate::models::{CancelOutcome, FillUpdate, OrderId, OrderRequest, OrderSnapshot, Quote};

#[derive(Debug, Deserialize)]
struct PositionResponse {
    quantity: Decimal,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    order_id: OrderId,
}

pub struct HttpExchange {
    client:   reqwest::Client,
    base_url: String,
    timeout:  Duration,
    fills_tx: broadcast::Sender<FillUpdate>,
}

impl HttpExchange {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        timeout: Duration,
        fills_tx: broadcast::Sender<FillUpdate>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            fills_tx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ExchangeError> {
        request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::Timeout
                } else {
                    error!(error = %e, "Exchange bridge unreachable");
                    ExchangeError::Transport(e.to_string())
                }
            })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ExchangeError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        response
            .json()
            .await
            .map_err(|e| ExchangeError::Decode(e.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ExchangeError> {
        let response = self.send(self.client.get(self.url(path))).await?;
        Self::decode(response).await
    }
}

/// Maps a non-2xx bridge answer onto the error taxonomy.
fn classify_status(status: StatusCode, body: String) -> ExchangeError {
    match status {
        StatusCode::NOT_FOUND => ExchangeError::NotFound(body),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ExchangeError::Rejected(body),
        StatusCode::NOT_IMPLEMENTED => ExchangeError::Unsupported(body),
        _ => ExchangeError::Http { status: status.as_u16(), body },
    }
}

#[async_trait]
impl Exchange for HttpExchange {
    async fn observe_position(&self, contract_id: &str) -> Result<Decimal, ExchangeError> {
        let resp: PositionResponse = self.get_json(&format!("/positions/{contract_id}")).await?;
        debug!(contract_id, position = %resp.quantity, "Position observed");
        Ok(resp.quantity)
    }

    async fn list_active_orders(&self, contract_id: &str) -> Result<Vec<OrderSnapshot>, ExchangeError> {
        let orders: Vec<OrderSnapshot> = self.get_json(&format!("/orders?contract={contract_id}")).await?;
        Ok(orders.into_iter().filter(|o| o.status.is_active()).collect())
    }

    async fn order_status(&self, order_id: &OrderId) -> Result<Option<OrderSnapshot>, ExchangeError> {
        match self.get_json(&format!("/orders/{order_id}")).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(ExchangeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<CancelOutcome, ExchangeError> {
        let response = self
            .send(self.client.delete(self.url(&format!("/orders/{order_id}"))))
            .await?;

        match response.status() {
            s if s.is_success() => {
                info!(%order_id, "Order canceled");
                Ok(CancelOutcome::Canceled)
            }
            // Already filled, already canceled or never existed: nothing left to cancel.
            StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::GONE => {
                debug!(%order_id, "Cancel: order already resolved");
                Ok(CancelOutcome::AlreadyResolved)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(%order_id, http_status = %status, body = %body, "Cancel failed");
                Err(classify_status(status, body))
            }
        }
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderId, ExchangeError> {
        info!(
            contract_id = %request.contract_id,
            side        = %request.side,
            quantity    = %request.quantity,
            kind        = ?request.kind,
            reduce_only = request.reduce_only,
            tag         = %request.client_tag,
            "🚀 Submitting order to bridge"
        );

        let response = self
            .send(self.client.post(self.url("/orders")).json(request))
            .await?;
        let resp: SubmitResponse = Self::decode(response).await?;

        info!(order_id = %resp.order_id, "✅ Bridge accepted order");
        Ok(resp.order_id)
    }

    async fn best_bid_ask(&self, contract_id: &str) -> Result<Quote, ExchangeError> {
        self.get_json(&format!("/bbo/{contract_id}")).await
    }

    fn subscribe_fills(&self, contract_id: &str) -> FillSubscription {
        FillSubscription::new(contract_id, self.fills_tx.subscribe())
    }
}
