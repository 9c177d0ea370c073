//! # exchange
//!
//! Boundary to the exchange connectivity layer.
//!
//! The engine only ever talks to `dyn Exchange`. Two implementations ship:
//! - [`HttpExchange`] — REST bridge in front of the real venue
//! - [`SimulatedExchange`] — in-memory venue for `EXCHANGE_URL=mock` and tests
//!
//! Streaming fills arrive on a `broadcast` channel. The REST bridge pushes them to
//! `POST /api/bridge/fills`, which feeds the same channel the simulator writes to.

pub mod http;
pub mod retry;
pub mod simulated;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use crate::models::{CancelOutcome, FillUpdate, OrderId, OrderRequest, OrderSnapshot, Quote};

pub use http::HttpExchange;
pub use retry::{with_retry, RetryPolicy};
pub use simulated::{FillScript, SimOp, SimulatedExchange};

/// Capacity of the fill fan-out channel.
pub const FILL_CHANNEL_CAPACITY: usize = 1024;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("exchange call timed out")]
    Timeout,

    #[error("exchange unreachable: {0}")]
    Transport(String),

    #[error("exchange HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("exchange response parse error: {0}")]
    Decode(String),

    #[error("exchange rejected request: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported by venue: {0}")]
    Unsupported(String),
}

impl ExchangeError {
    /// Network-level failures that may succeed on a plain retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Timeout | ExchangeError::Transport(_) => true,
            ExchangeError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

// ─── Exchange ─────────────────────────────────────────────────────────────────

/// Everything the guard consumes from the venue.
///
/// Implementations must make `cancel_order` idempotent: an order that is already
/// filled or gone answers `AlreadyResolved`, not an error.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Signed settled position for `contract_id`.
    async fn observe_position(&self, contract_id: &str) -> Result<Decimal, ExchangeError>;

    /// Orders still resting (or in an unknown state) for `contract_id`.
    async fn list_active_orders(&self, contract_id: &str) -> Result<Vec<OrderSnapshot>, ExchangeError>;

    /// Authoritative status of one order. `None` if the venue does not know it.
    async fn order_status(&self, order_id: &OrderId) -> Result<Option<OrderSnapshot>, ExchangeError>;

    async fn cancel_order(&self, order_id: &OrderId) -> Result<CancelOutcome, ExchangeError>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderId, ExchangeError>;

    async fn best_bid_ask(&self, contract_id: &str) -> Result<Quote, ExchangeError>;

    /// Push-based fill feed for `contract_id`. Subscribe before submitting so the
    /// earliest notifications are not missed.
    fn subscribe_fills(&self, contract_id: &str) -> FillSubscription;
}

// ─── FillSubscription ─────────────────────────────────────────────────────────

/// Receiver over the shared fill channel, filtered to one contract.
pub struct FillSubscription {
    contract_id: String,
    rx:          broadcast::Receiver<FillUpdate>,
}

impl FillSubscription {
    pub fn new(contract_id: &str, rx: broadcast::Receiver<FillUpdate>) -> Self {
        Self {
            contract_id: contract_id.to_string(),
            rx,
        }
    }

    /// Next update for this contract. `None` once the channel is closed.
    ///
    /// A lagging receiver skips what it missed; the poll side still covers those
    /// orders, so lag only costs latency.
    pub async fn next(&mut self) -> Option<FillUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) if update.contract_id == self.contract_id => return Some(update),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(contract_id = %self.contract_id, skipped = n, "Fill stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use rust_decimal_macros::dec;

    fn update(contract: &str, id: &str) -> FillUpdate {
        FillUpdate {
            order_id:        OrderId::from(id),
            contract_id:     contract.to_string(),
            status:          OrderStatus::Filled,
            filled_quantity: dec!(1),
            timestamp:       chrono::Utc::now(),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Timeout.is_transient());
        assert!(ExchangeError::Transport("reset".into()).is_transient());
        assert!(ExchangeError::Http { status: 503, body: String::new() }.is_transient());
        assert!(!ExchangeError::Http { status: 400, body: String::new() }.is_transient());
        assert!(!ExchangeError::Rejected("margin".into()).is_transient());
    }

    #[tokio::test]
    async fn test_subscription_filters_other_contracts() {
        let (tx, rx) = broadcast::channel(16);
        let mut sub = FillSubscription::new("ETH", rx);

        tx.send(update("BTC", "a")).unwrap();
        tx.send(update("ETH", "b")).unwrap();
        drop(tx);

        assert_eq!(sub.next().await.map(|u| u.order_id), Some(OrderId::from("b")));
        assert_eq!(sub.next().await, None);
    }
}
