//! # engine::fill_waiter
//!
//! **Fill Waiter** — waits on one submitted order with the streaming feed and the
//! order-status poll running side by side.
//!
//! ```text
//! select! {
//!     deadline        → expire() → final authoritative check → outcome
//!     halt switch     → same as deadline
//!     fills.next()    → record(stream evidence)
//!     ticker.tick()   → record(poll evidence) → FILLED returns at once
//! }
//! ```
//!
//! The poll interval is short (default 2s) so a fast fill is seen well inside one
//! wait.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::FillWaitConfig;
use crate::engine::evidence::{FillConfidence, FillEvidence, SharedEvidence};
use crate::error::GuardError;
use crate::exchange::{with_retry, Exchange, FillSubscription, RetryPolicy};
use crate::models::{is_flat, OrderId, OrderSide, OrderStatus};
use crate::risk::RiskManager;

// ─── Types ────────────────────────────────────────────────────────────────────

/// What the waiter needs to know about the order it is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedOrder {
    pub order_id:          OrderId,
    pub contract_id:       String,
    pub side:              OrderSide,
    pub quantity:          Decimal,
    /// Position observed before submission; the final check measures against it.
    pub baseline_position: Decimal,
}

/// Three-way result: clean fill, ambiguous, clean no-fill (plus the terminal odds).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillOutcome {
    Filled(Decimal),
    /// Stream said filled, the account never confirmed. Never safe to resubmit.
    TimedOutAmbiguous,
    /// Nothing ever reported a fill. Safe to cancel and retry.
    TimedOutUnfilled,
    Canceled,
    Error(String),
}

// ─── FillWaiter ───────────────────────────────────────────────────────────────

pub struct FillWaiter {
    exchange: Arc<dyn Exchange>,
    evidence: SharedEvidence,
    risk:     Arc<RiskManager>,
    retry:    RetryPolicy,
}

impl FillWaiter {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        evidence: SharedEvidence,
        risk: Arc<RiskManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self { exchange, evidence, risk, retry }
    }

    /// Waits at most `timing.max_wait` for `order` to resolve.
    ///
    /// `fills` must have been subscribed before the order was submitted.
    pub async fn await_fill(
        &self,
        order: &SubmittedOrder,
        fills: &mut FillSubscription,
        timing: FillWaitConfig,
    ) -> FillOutcome {
        self.evidence.write().await.track(&order.order_id, &order.contract_id);

        let deadline = Instant::now() + timing.max_wait;
        let mut ticker = tokio::time::interval(timing.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stream_open = true;

        info!(
            order_id  = %order.order_id,
            max_wait  = ?timing.max_wait,
            poll      = ?timing.poll_interval,
            "⏳ Waiting for fill"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,

                // Halted: one final check for the record. The controller discards the outcome.
                reason = self.risk.halted() => {
                    warn!(order_id = %order.order_id, "Fill wait halted, final check only: {}", reason.message);
                    break;
                }

                update = fills.next(), if stream_open => match update {
                    Some(update) if update.order_id == order.order_id => {
                        self.evidence.write().await.record(FillEvidence::from_stream(&update));
                    }
                    Some(_) => {}
                    None => {
                        warn!(order_id = %order.order_id, "Fill stream closed; continuing on poll only");
                        stream_open = false;
                    }
                },

                _ = ticker.tick() => match self.poll_once(order).await {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => {}
                    // Transient poll failures cost one tick, nothing more.
                    Err(e) => warn!(order_id = %order.order_id, error = %e, "Order status poll failed"),
                },
            }
        }

        self.resolve_expired(order).await
    }

    /// One poll. `Some` when the order status alone settles the outcome.
    async fn poll_once(&self, order: &SubmittedOrder) -> Result<Option<FillOutcome>, GuardError> {
        let snapshot = with_retry("order_status", &self.retry, || {
            self.exchange.order_status(&order.order_id)
        })
        .await?;

        let Some(snapshot) = snapshot else {
            debug!(order_id = %order.order_id, "Order not visible to the poll yet");
            return Ok(None);
        };

        let mut evidence = self.evidence.write().await;
        evidence.record(FillEvidence::from_poll(&snapshot));

        let outcome = match snapshot.status {
            OrderStatus::Filled => {
                let qty = if snapshot.filled_quantity > Decimal::ZERO {
                    snapshot.filled_quantity
                } else {
                    order.quantity
                };
                Some(FillOutcome::Filled(qty))
            }
            OrderStatus::Canceled | OrderStatus::Rejected if !is_flat(snapshot.filled_quantity) => {
                // Partial fill, remainder gone: the filled part is real.
                evidence.confirm(&order.order_id, snapshot.filled_quantity);
                Some(FillOutcome::Filled(snapshot.filled_quantity))
            }
            OrderStatus::Canceled | OrderStatus::Rejected
                if evidence.current_confidence(&order.order_id) == FillConfidence::Unconfirmed =>
            {
                Some(FillOutcome::Canceled)
            }
            // Terminal with no fill but the stream claims one: left to the final check.
            _ => None,
        };

        if let Some(outcome) = &outcome {
            info!(order_id = %order.order_id, status = ?snapshot.status, ?outcome, "Order resolved by poll");
        }
        Ok(outcome)
    }

    async fn resolve_expired(&self, order: &SubmittedOrder) -> FillOutcome {
        let confidence = self.evidence.write().await.expire(&order.order_id);

        if confidence == FillConfidence::ApiConfirmed {
            let qty = self.evidence.read().await.filled_quantity(&order.order_id);
            return FillOutcome::Filled(qty);
        }

        let ambiguous = confidence == FillConfidence::AmbiguousTimeout;
        match self.final_check(order).await {
            Ok(Some(qty)) => {
                self.evidence.write().await.confirm(&order.order_id, qty);
                info!(order_id = %order.order_id, %qty, from = %confidence, "✅ Fill confirmed by final re-observation");
                FillOutcome::Filled(qty)
            }
            Ok(None) if ambiguous => {
                warn!(order_id = %order.order_id, "Fill still ambiguous after final re-observation");
                FillOutcome::TimedOutAmbiguous
            }
            Ok(None) => {
                info!(order_id = %order.order_id, "No fill observed within the wait");
                FillOutcome::TimedOutUnfilled
            }
            // An ambiguous order stays ambiguous; a failed check proves nothing.
            Err(e) if ambiguous => {
                warn!(order_id = %order.order_id, error = %e, "Final re-observation failed");
                FillOutcome::TimedOutAmbiguous
            }
            Err(e) => FillOutcome::Error(e.to_string()),
        }
    }

    /// Authoritative order status, then the position delta against the baseline.
    async fn final_check(&self, order: &SubmittedOrder) -> Result<Option<Decimal>, GuardError> {
        let snapshot = with_retry("order_status", &self.retry, || {
            self.exchange.order_status(&order.order_id)
        })
        .await?;

        if let Some(snapshot) = snapshot {
            self.evidence.write().await.record(FillEvidence::from_poll(&snapshot));
            if !is_flat(snapshot.filled_quantity) {
                return Ok(Some(snapshot.filled_quantity));
            }
        }

        let position = with_retry("observe_position", &self.retry, || {
            self.exchange.observe_position(&order.contract_id)
        })
        .await?;

        let delta = (position - order.baseline_position) * order.side.sign();
        debug!(
            order_id = %order.order_id,
            baseline = %order.baseline_position,
            %position,
            %delta,
            "Final position check"
        );

        if delta > Decimal::ZERO && !is_flat(delta) {
            Ok(Some(delta.min(order.quantity)))
        } else {
            Ok(None)
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::evidence::EvidenceAggregator;
    use crate::exchange::{FillScript, SimOp, SimulatedExchange};
    use crate::models::{HaltCause, HaltReason, OrderRequest};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn timing(max_wait: u64, poll: u64) -> FillWaitConfig {
        FillWaitConfig {
            max_wait:      Duration::from_secs(max_wait),
            poll_interval: Duration::from_secs(poll),
        }
    }

    struct Harness {
        venue:    SimulatedExchange,
        evidence: SharedEvidence,
        risk:     Arc<RiskManager>,
        waiter:   FillWaiter,
    }

    fn harness() -> Harness {
        let venue = SimulatedExchange::standalone();
        let evidence = EvidenceAggregator::shared();
        let risk = Arc::new(RiskManager::new(0));
        let waiter = FillWaiter::new(
            Arc::new(venue.clone()),
            evidence.clone(),
            risk.clone(),
            RetryPolicy::default(),
        );
        Harness { venue, evidence, risk, waiter }
    }

    async fn submit(h: &Harness, script: FillScript, qty: Decimal) -> (SubmittedOrder, FillSubscription) {
        h.venue.push_script(script);
        let fills = h.venue.subscribe_fills("ETH");
        let baseline = h.venue.observe_position("ETH").await.unwrap();
        let order_id = h
            .venue
            .submit_order(&OrderRequest::market("ETH", OrderSide::Buy, qty))
            .await
            .unwrap();
        let order = SubmittedOrder {
            order_id,
            contract_id:       "ETH".into(),
            side:              OrderSide::Buy,
            quantity:          qty,
            baseline_position: baseline,
        };
        (order, fills)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_then_lagging_poll_fills_once() {
        let h = harness();
        let (order, mut fills) = submit(
            &h,
            FillScript::lagging_poll(Duration::from_secs(1), Duration::from_secs(6)),
            dec!(0.05),
        )
        .await;

        let started = Instant::now();
        let outcome = h.waiter.await_fill(&order, &mut fills, timing(8, 2)).await;

        assert_eq!(outcome, FillOutcome::Filled(dec!(0.05)));
        assert!(started.elapsed() <= Duration::from_secs(8));
        assert_eq!(h.evidence.read().await.current_confidence(&order.order_id), FillConfidence::ApiConfirmed);
        assert_eq!(h.venue.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_only_is_ambiguous_not_unfilled() {
        let h = harness();
        let (order, mut fills) = submit(&h, FillScript::stream_only(Duration::from_secs(1)), dec!(0.05)).await;

        let outcome = h.waiter.await_fill(&order, &mut fills, timing(8, 2)).await;

        assert_eq!(outcome, FillOutcome::TimedOutAmbiguous);
        assert_eq!(
            h.evidence.read().await.unresolved_ambiguous("ETH"),
            vec![order.order_id.clone()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_resolved_by_position_delta() {
        let h = harness();
        // Order API never catches up, but the account does.
        let script = FillScript::stream_only(Duration::from_secs(1)).with_position_after(Duration::from_secs(3));
        let (order, mut fills) = submit(&h, script, dec!(0.05)).await;

        let outcome = h.waiter.await_fill(&order, &mut fills, timing(8, 2)).await;

        assert_eq!(outcome, FillOutcome::Filled(dec!(0.05)));
        assert!(h.evidence.read().await.unresolved_ambiguous("ETH").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_order_times_out_unfilled() {
        let h = harness();
        let (order, mut fills) = submit(&h, FillScript::never(), dec!(1)).await;

        let outcome = h.waiter.await_fill(&order, &mut fills, timing(6, 2)).await;
        assert_eq!(outcome, FillOutcome::TimedOutUnfilled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_epsilon_position_drift_is_not_a_fill() {
        let h = harness();
        let (order, mut fills) = submit(&h, FillScript::never(), dec!(1)).await;
        h.venue.set_position("ETH", dec!(0.0005));

        let outcome = h.waiter.await_fill(&order, &mut fills, timing(6, 2)).await;
        assert_eq!(outcome, FillOutcome::TimedOutUnfilled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_stream_and_poll_errors_are_tolerated() {
        let h = harness();
        let script = FillScript::lagging_poll(Duration::from_secs(1), Duration::from_secs(3)).with_duplicate_stream();
        let (order, mut fills) = submit(&h, script, dec!(0.05)).await;
        // First poll burns its whole retry budget; the next tick recovers.
        h.venue.fail_next(SimOp::OrderStatus, 3);

        let outcome = h.waiter.await_fill(&order, &mut fills, timing(10, 2)).await;
        assert_eq!(outcome, FillOutcome::Filled(dec!(0.05)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_partial_reports_filled_part() {
        let h = harness();
        let script = FillScript::immediate().with_fill_ratio(dec!(0.6));
        let (order, mut fills) = submit(&h, script, dec!(1)).await;
        h.venue.cancel_order(&order.order_id).await.unwrap();

        let outcome = h.waiter.await_fill(&order, &mut fills, timing(8, 2)).await;
        assert_eq!(outcome, FillOutcome::Filled(dec!(0.6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_without_fill() {
        let h = harness();
        let (order, mut fills) = submit(&h, FillScript::never(), dec!(1)).await;
        h.venue.cancel_order(&order.order_id).await.unwrap();

        let outcome = h.waiter.await_fill(&order, &mut fills, timing(8, 2)).await;
        assert_eq!(outcome, FillOutcome::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_cuts_the_wait_short() {
        let h = harness();
        let (order, mut fills) = submit(&h, FillScript::never(), dec!(1)).await;

        let risk = h.risk.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            risk.halt(HaltReason::new(HaltCause::Manual, "operator"));
        });

        let started = Instant::now();
        let outcome = h.waiter.await_fill(&order, &mut fills, timing(30, 2)).await;
        assert_eq!(outcome, FillOutcome::TimedOutUnfilled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
