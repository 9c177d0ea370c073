//! # engine::gate
//!
//! **Order Gate** — the one door every submission goes through.
//!
//! The gate re-derives its answer from the exchange on every call; it never trusts
//! what the process believes it did earlier. Checks, in order:
//! 1. an AMBIGUOUS_TIMEOUT order still unresolved → Blocked
//! 2. position beyond epsilon → Blocked
//! 3. active orders → cancel them (idempotent), settle, re-list; survivors → Blocked
//!
//! Both the gate and the Close Executor run the cancellation step through
//! [`cancel_active_orders`].

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::evidence::SharedEvidence;
use crate::error::GuardError;
use crate::exchange::{with_retry, Exchange, RetryPolicy};
use crate::models::{is_flat, CancelOutcome, OrderId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    /// A stream-reported fill was never confirmed or refuted.
    AmbiguousFill { order_ids: Vec<OrderId> },
    ExistingPosition { quantity: Decimal },
    UncancelableOrders { order_ids: Vec<OrderId> },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::AmbiguousFill { order_ids }      => write!(f, "ambiguous fill on {order_ids:?}"),
            BlockReason::ExistingPosition { quantity }    => write!(f, "existing position {quantity}"),
            BlockReason::UncancelableOrders { order_ids } => write!(f, "uncancelable orders {order_ids:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allowed,
    Blocked(BlockReason),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }
}

// ─── OrderGate ────────────────────────────────────────────────────────────────

pub struct OrderGate {
    exchange:      Arc<dyn Exchange>,
    evidence:      SharedEvidence,
    retry:         RetryPolicy,
    cancel_settle: Duration,
}

impl OrderGate {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        evidence: SharedEvidence,
        retry: RetryPolicy,
        cancel_settle: Duration,
    ) -> Self {
        Self { exchange, evidence, retry, cancel_settle }
    }

    pub async fn may_place(&self, contract_id: &str) -> Result<GateDecision, GuardError> {
        let ambiguous = self.evidence.read().await.unresolved_ambiguous(contract_id);
        if !ambiguous.is_empty() {
            return Ok(self.blocked(contract_id, None, BlockReason::AmbiguousFill { order_ids: ambiguous }));
        }

        let position = with_retry("observe_position", &self.retry, || {
            self.exchange.observe_position(contract_id)
        })
        .await?;
        if !is_flat(position) {
            return Ok(self.blocked(
                contract_id,
                Some(position),
                BlockReason::ExistingPosition { quantity: position },
            ));
        }

        let remaining = self.cancel_active_orders(contract_id).await?;
        if !remaining.is_empty() {
            return Ok(self.blocked(
                contract_id,
                Some(position),
                BlockReason::UncancelableOrders { order_ids: remaining },
            ));
        }

        info!(contract_id, %position, "🟢 Gate: allowed");
        Ok(GateDecision::Allowed)
    }

    pub async fn cancel_active_orders(&self, contract_id: &str) -> Result<Vec<OrderId>, GuardError> {
        cancel_active_orders(self.exchange.as_ref(), contract_id, &self.retry, self.cancel_settle).await
    }

    fn blocked(&self, contract_id: &str, position: Option<Decimal>, reason: BlockReason) -> GateDecision {
        warn!(contract_id, position = ?position, reason = %reason, "🚫 Gate: blocked");
        GateDecision::Blocked(reason)
    }
}

/// Cancels every active order on `contract_id`, waits `settle`, and returns the ids
/// that are still active afterwards.
pub async fn cancel_active_orders(
    exchange: &dyn Exchange,
    contract_id: &str,
    retry: &RetryPolicy,
    settle: Duration,
) -> Result<Vec<OrderId>, GuardError> {
    let active = with_retry("list_active_orders", retry, || exchange.list_active_orders(contract_id)).await?;
    if active.is_empty() {
        return Ok(Vec::new());
    }

    info!(contract_id, count = active.len(), "Canceling active orders");
    for order in &active {
        match with_retry("cancel_order", retry, || exchange.cancel_order(&order.order_id)).await {
            Ok(CancelOutcome::Canceled) => {}
            Ok(CancelOutcome::AlreadyResolved) => {
                info!(order_id = %order.order_id, "Cancel: already resolved");
            }
            // Whatever is left shows up in the re-list below.
            Err(e) => warn!(order_id = %order.order_id, error = %e, "Cancel failed"),
        }
    }

    tokio::time::sleep(settle).await;

    let remaining: Vec<OrderId> = with_retry("list_active_orders", retry, || exchange.list_active_orders(contract_id))
        .await?
        .into_iter()
        .map(|o| o.order_id)
        .collect();

    if !remaining.is_empty() {
        warn!(contract_id, ?remaining, "Orders survived cancellation");
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::evidence::{EvidenceAggregator, FillEvidence};
    use crate::exchange::{SimOp, SimulatedExchange};
    use crate::models::{FillUpdate, OrderSide, OrderStatus};
    use rust_decimal_macros::dec;

    fn gate(venue: &SimulatedExchange) -> (OrderGate, SharedEvidence) {
        let evidence = EvidenceAggregator::shared();
        let gate = OrderGate::new(
            Arc::new(venue.clone()),
            evidence.clone(),
            RetryPolicy::default(),
            Duration::from_secs(1),
        );
        (gate, evidence)
    }

    #[tokio::test(start_paused = true)]
    async fn test_allows_when_flat_and_quiet() {
        let venue = SimulatedExchange::standalone();
        let (gate, _) = gate(&venue);
        assert_eq!(gate.may_place("ETH").await.unwrap(), GateDecision::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_on_position_beyond_epsilon() {
        let venue = SimulatedExchange::standalone();
        let (gate, _) = gate(&venue);

        venue.set_position("ETH", dec!(0.05));
        assert_eq!(
            gate.may_place("ETH").await.unwrap(),
            GateDecision::Blocked(BlockReason::ExistingPosition { quantity: dec!(0.05) })
        );

        venue.set_position("ETH", dec!(-0.001));
        assert!(!gate.may_place("ETH").await.unwrap().is_allowed());

        // Dust below epsilon is flat.
        venue.set_position("ETH", dec!(0.0009));
        assert!(gate.may_place("ETH").await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancels_stale_orders_then_allows() {
        let venue = SimulatedExchange::standalone();
        let (gate, _) = gate(&venue);
        let stale = venue.add_resting_order("ETH", OrderSide::Buy, dec!(1), true);

        assert!(gate.may_place("ETH").await.unwrap().is_allowed());
        assert_eq!(venue.cancel_calls(), vec![stale]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_on_uncancelable_orders() {
        let venue = SimulatedExchange::standalone();
        let (gate, _) = gate(&venue);
        let stuck = venue.add_resting_order("ETH", OrderSide::Sell, dec!(1), false);

        assert_eq!(
            gate.may_place("ETH").await.unwrap(),
            GateDecision::Blocked(BlockReason::UncancelableOrders { order_ids: vec![stuck] })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_while_fill_is_ambiguous() {
        let venue = SimulatedExchange::standalone();
        let (gate, evidence) = gate(&venue);
        {
            let mut agg = evidence.write().await;
            agg.record(FillEvidence::from_stream(&FillUpdate {
                order_id:        OrderId::from("A"),
                contract_id:     "ETH".into(),
                status:          OrderStatus::Filled,
                filled_quantity: dec!(0.05),
                timestamp:       chrono::Utc::now(),
            }));
            agg.expire(&OrderId::from("A"));
        }

        assert!(matches!(
            gate.may_place("ETH").await.unwrap(),
            GateDecision::Blocked(BlockReason::AmbiguousFill { .. })
        ));
        // Other contracts are unaffected.
        assert!(gate.may_place("BTC").await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_exchange_is_an_error_not_allowed() {
        let venue = SimulatedExchange::standalone();
        let (gate, _) = gate(&venue);
        venue.fail_next(SimOp::ObservePosition, 3);

        assert!(matches!(
            gate.may_place("ETH").await,
            Err(GuardError::TransientIo { op: "observe_position", .. })
        ));
    }
}
