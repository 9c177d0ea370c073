//! # engine::controller
//!
//! **Reconciliation Controller** — one control-loop iteration as a state machine.
//!
//! ```text
//! CLEANUP ──position──────────────────────────────────▶ CLOSE_IF_NEEDED
//!    │ flat                                                  │
//!    ▼                                                       │
//! GATE_CHECK ──Blocked──▶ resolve / retry budget             │
//!    │ Allowed                                               │
//!    ▼                                                       ▼
//! SUBMIT ─▶ AWAIT_FILL ─Filled──▶ hold ───────────────▶ CLOSE_IF_NEEDED ─▶ DONE
//!              │                                             │
//!              ├─ TimedOutAmbiguous → re-observe ────────────┤ StillOpen / Error
//!              └─ TimedOutUnfilled / Canceled → cancel       ▼
//!                                                         HALTED
//! ```
//!
//! An existing position at CLEANUP is an anomaly to flatten, never "my last fill".
//! A close that leaves a residual after its bounded retries halts the run: each
//! iteration adds at most one unresolved position before the guard stops itself.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::{EntryOrder, GuardConfig};
use crate::engine::close::{CloseExecutor, CloseOutcome};
use crate::engine::evidence::SharedEvidence;
use crate::engine::fill_waiter::{FillOutcome, FillWaiter, SubmittedOrder};
use crate::engine::gate::{BlockReason, GateDecision, OrderGate};
use crate::error::GuardError;
use crate::events::{EventBus, GuardEvent};
use crate::exchange::{with_retry, Exchange};
use crate::models::{
    is_flat, CycleAction, CycleOutcome, CycleResult, HaltCause, HaltReason, OrderId,
    OrderRequest, OrderSide, ReconciliationCycle, SharedHistory,
};
use crate::risk::{FailureBudget, RiskManager};

/// How a cycle ended, before the retry budget has had its say.
#[derive(Debug)]
enum Step {
    /// Flat, nothing in flight.
    Done(Option<String>),
    /// Non-fatal; counted against the retry budget.
    Retry(String),
    Halt(HaltReason),
}

pub struct ReconciliationController {
    config:   Arc<GuardConfig>,
    exchange: Arc<dyn Exchange>,
    evidence: SharedEvidence,
    risk:     Arc<RiskManager>,
    history:  SharedHistory,
    events:   EventBus,
    gate:     OrderGate,
    waiter:   FillWaiter,
    closer:   CloseExecutor,
    cycle_no: u64,
}

impl ReconciliationController {
    pub fn new(
        config: Arc<GuardConfig>,
        exchange: Arc<dyn Exchange>,
        evidence: SharedEvidence,
        risk: Arc<RiskManager>,
        history: SharedHistory,
        events: EventBus,
    ) -> Self {
        let gate = OrderGate::new(exchange.clone(), evidence.clone(), config.retry, config.cancel_settle);
        let waiter = FillWaiter::new(exchange.clone(), evidence.clone(), risk.clone(), config.retry);
        let closer = CloseExecutor::from_config(exchange.clone(), &config, events.clone())
            .with_halt(risk.clone());

        Self {
            config,
            exchange,
            evidence,
            risk,
            history,
            events,
            gate,
            waiter,
            closer,
            cycle_no: 0,
        }
    }

    fn contract(&self) -> &str {
        &self.config.contract_id
    }

    // ─── Loop ─────────────────────────────────────────────────────────────────

    /// Runs cycles until halted or `loop_count` is reached. Returns the halt reason, if any.
    pub async fn run(&mut self) -> Option<HaltReason> {
        info!(
            contract_id = %self.config.contract_id,
            side        = %self.config.side,
            quantity    = %self.config.quantity,
            loop_count  = ?self.config.loop_count,
            "🔄 Reconciliation loop started"
        );

        loop {
            if let Some(max) = self.config.loop_count {
                if self.cycle_no >= max {
                    info!(cycles = self.cycle_no, "Loop count reached, stopping");
                    return None;
                }
            }

            if let CycleResult::Halted(reason) = self.run_cycle().await {
                error!(cycles = self.cycle_no, "🛑 Loop stopped: {reason}");
                return Some(reason);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.cycle_interval) => {}
                reason = self.risk.halted() => {
                    error!(cycles = self.cycle_no, "🛑 Loop stopped: {reason}");
                    return Some(reason);
                }
            }
        }
    }

    /// One full CLEANUP → … → DONE | HALTED pass.
    pub async fn run_cycle(&mut self) -> CycleResult {
        if let Some(reason) = self.risk.halt_reason() {
            return CycleResult::Halted(reason);
        }

        self.cycle_no += 1;
        let expected = self.config.side.sign() * self.config.quantity;
        let mut cycle = ReconciliationCycle::start(self.cycle_no, self.contract(), expected);

        info!(cycle_no = self.cycle_no, contract_id = %self.config.contract_id, "▶️ Cycle started");
        self.events.publish(GuardEvent::CycleStarted {
            cycle_no:    self.cycle_no,
            contract_id: self.config.contract_id.clone(),
        });

        let step = self.drive(&mut cycle).await;
        self.conclude(cycle, step).await
    }

    // ─── States ───────────────────────────────────────────────────────────────

    async fn drive(&self, cycle: &mut ReconciliationCycle) -> Step {
        // CLEANUP
        let position = match self.observe().await {
            Ok(p) => p,
            Err(e) => return Step::Retry(format!("cleanup: {e}")),
        };
        cycle.observed_position = Some(position);

        if !is_flat(position) {
            warn!(
                cycle_no    = cycle.cycle_no,
                contract_id = %cycle.contract_id,
                %position,
                "⚠️ Position found at loop start, forcing close"
            );
            cycle.action = CycleAction::ForcedClose;
            return self.close_if_needed().await;
        }

        // GATE_CHECK
        if let Some(step) = self.check_gate(cycle).await {
            return step;
        }

        // SUBMIT → AWAIT_FILL. A dead ambiguous order buys exactly one resubmission.
        let mut retried = false;
        loop {
            if let Some(reason) = self.risk.halt_reason() {
                return Step::Halt(reason);
            }

            let baseline = match self.observe().await {
                Ok(p) => p,
                Err(e) => return Step::Retry(format!("baseline: {e}")),
            };

            let mut fills = self.exchange.subscribe_fills(self.contract());
            let request = match self.entry_request().await {
                Ok(r) => r,
                Err(e) => return Step::Retry(format!("entry price: {e}")),
            };

            let single = self.config.retry.single();
            let order_id = match with_retry("submit_order", &single, || self.exchange.submit_order(&request)).await {
                Ok(id) => id,
                Err(e) => return Step::Retry(format!("submit: {e}")),
            };

            cycle.order_ids.push(order_id.clone());
            cycle.action = CycleAction::Submitted;
            self.evidence.write().await.track(&order_id, self.contract());
            info!(cycle_no = cycle.cycle_no, %order_id, tag = %request.client_tag, "📨 Entry order submitted");
            self.events.publish(GuardEvent::OrderSubmitted {
                cycle_no: cycle.cycle_no,
                order_id: order_id.clone(),
                request:  Box::new(request.clone()),
            });

            let order = SubmittedOrder {
                order_id:          order_id.clone(),
                contract_id:       self.config.contract_id.clone(),
                side:              request.side,
                quantity:          request.quantity,
                baseline_position: baseline,
            };

            let outcome = self.waiter.await_fill(&order, &mut fills, self.config.fill).await;
            self.events.publish(GuardEvent::FillResolved {
                order_id: order_id.clone(),
                outcome:  outcome.clone(),
            });

            match outcome {
                FillOutcome::Filled(qty) => {
                    cycle.filled_quantity = Some(qty);
                    // Remainder of a partial must not fill behind our back.
                    self.cancel_quietly(&order_id).await;
                    self.hold().await;
                    return self.close_and_release(&[order_id]).await;
                }

                FillOutcome::TimedOutAmbiguous => {
                    let position = match self.observe().await {
                        // Evidence stays AMBIGUOUS_TIMEOUT; the gate keeps blocking.
                        Err(e) => return Step::Retry(format!("re-observe after ambiguous fill: {e}")),
                        Ok(p) => p,
                    };
                    if !is_flat(position) {
                        cycle.action = CycleAction::ResolvedAmbiguous;
                        return self.close_and_release(&[order_id]).await;
                    }

                    warn!(%order_id, %position, "Ambiguous fill left no position, treating order as dead");
                    self.cancel_quietly(&order_id).await;
                    self.evidence.write().await.forget(&order_id);

                    if retried {
                        let err = GuardError::AmbiguousState {
                            order_id: order_id.clone(),
                            detail:   "ambiguous again after resubmission".to_string(),
                        };
                        return Step::Retry(err.to_string());
                    }
                    retried = true;

                    if let Some(step) = self.check_gate(cycle).await {
                        return step;
                    }
                }

                FillOutcome::TimedOutUnfilled | FillOutcome::Canceled => {
                    self.cancel_quietly(&order_id).await;
                    self.evidence.write().await.forget(&order_id);
                    // The cancel may have raced a fill.
                    return match self.observe().await {
                        Ok(p) if is_flat(p) => Step::Done(Some(format!("entry {order_id} not filled"))),
                        Ok(_) => self.close_if_needed().await,
                        Err(e) => Step::Retry(format!("re-observe after no fill: {e}")),
                    };
                }

                FillOutcome::Error(e) => {
                    self.cancel_quietly(&order_id).await;
                    self.evidence.write().await.forget(&order_id);
                    return Step::Retry(format!("fill wait on {order_id}: {e}"));
                }
            }
        }
    }

    /// `None` when the gate allows a submission; otherwise how the cycle ends.
    async fn check_gate(&self, cycle: &mut ReconciliationCycle) -> Option<Step> {
        let reason = match self.gate.may_place(self.contract()).await {
            Ok(GateDecision::Allowed) => return None,
            Ok(GateDecision::Blocked(reason)) => reason,
            Err(e) => return Some(Step::Retry(format!("gate: {e}"))),
        };

        self.events.publish(GuardEvent::GateBlocked {
            cycle_no:    cycle.cycle_no,
            contract_id: self.config.contract_id.clone(),
            reason:      reason.clone(),
        });
        cycle.note = Some(format!("gate blocked: {reason}"));

        let step = match reason {
            BlockReason::AmbiguousFill { order_ids } => {
                cycle.action = CycleAction::ResolvedAmbiguous;
                self.resolve_ambiguous(&order_ids).await
            }
            BlockReason::ExistingPosition { .. } => {
                cycle.action = CycleAction::ForcedClose;
                self.close_if_needed().await
            }
            BlockReason::UncancelableOrders { order_ids } => {
                let err = GuardError::UncancelableOrders {
                    contract_id: self.config.contract_id.clone(),
                    order_ids,
                };
                Step::Retry(err.to_string())
            }
        };
        Some(step)
    }

    /// Authoritative re-observation of orders an earlier wait left ambiguous.
    async fn resolve_ambiguous(&self, order_ids: &[OrderId]) -> Step {
        let position = match self.observe().await {
            Ok(p) => p,
            Err(e) => return Step::Retry(format!("resolve ambiguous: {e}")),
        };

        if !is_flat(position) {
            info!(?order_ids, %position, "Ambiguous fill is real, closing");
            return self.close_and_release(order_ids).await;
        }

        for order_id in order_ids {
            self.cancel_quietly(order_id).await;
            self.evidence.write().await.forget(order_id);
        }
        info!(?order_ids, "Ambiguous orders left no position, released");
        Step::Done(Some(format!("released ambiguous orders {order_ids:?}")))
    }

    /// CLOSE_IF_NEEDED, then release the evidence of the orders it settled.
    async fn close_and_release(&self, order_ids: &[OrderId]) -> Step {
        let step = self.close_if_needed().await;
        if matches!(step, Step::Done(_)) {
            let mut evidence = self.evidence.write().await;
            for order_id in order_ids {
                evidence.forget(order_id);
            }
        }
        step
    }

    async fn close_if_needed(&self) -> Step {
        // No submissions once halted, close orders included.
        if let Some(reason) = self.risk.halt_reason() {
            return Step::Halt(reason);
        }

        match self.closer.close_with_retries(self.contract()).await {
            CloseOutcome::Closed => Step::Done(None),
            CloseOutcome::StillOpen(residual) => {
                let err = GuardError::ResidualPosition {
                    contract_id: self.config.contract_id.clone(),
                    residual,
                };
                Step::Halt(
                    HaltReason::new(HaltCause::ResidualPosition, err.to_string())
                        .with_state(Some(residual), self.active_order_ids().await),
                )
            }
            CloseOutcome::Error(e) => {
                let position = self.observe().await.ok();
                Step::Halt(
                    HaltReason::new(HaltCause::CloseFailed, format!("close could not be verified: {e}"))
                        .with_state(position, self.active_order_ids().await),
                )
            }
        }
    }

    // ─── Conclusion ───────────────────────────────────────────────────────────

    async fn conclude(&self, mut cycle: ReconciliationCycle, step: Step) -> CycleResult {
        let result = match step {
            Step::Done(note) => {
                self.risk.record_success().await;
                cycle.finish(CycleOutcome::Flat, note);
                CycleResult::Continued
            }
            Step::Retry(what) => {
                let budget = self.risk.record_failure(&what).await;
                cycle.finish(CycleOutcome::Retry, Some(what.clone()));
                match budget {
                    FailureBudget::Retry { .. } => CycleResult::Continued,
                    FailureBudget::Exhausted { consecutive } => {
                        let position = self.observe().await.ok();
                        let reason = HaltReason::new(
                            HaltCause::RetryBudgetExhausted,
                            format!("{consecutive} consecutive failures, last: {what}"),
                        )
                        .with_state(position, self.active_order_ids().await);
                        self.halt(reason)
                    }
                }
            }
            Step::Halt(reason) => self.halt(reason),
        };

        // A halt that tripped mid-cycle still ends the run.
        let result = match (result, self.risk.halt_reason()) {
            (CycleResult::Continued, Some(reason)) => CycleResult::Halted(reason),
            (result, _) => result,
        };
        if result.is_halted() {
            cycle.outcome = CycleOutcome::Halted;
            cycle.finished_at.get_or_insert_with(chrono::Utc::now);
        }

        cycle.final_position = self.observe().await.ok();
        info!(
            cycle_no = cycle.cycle_no,
            outcome  = ?cycle.outcome,
            action   = ?cycle.action,
            final_position = ?cycle.final_position,
            "⏹️ Cycle completed"
        );

        self.events.publish(GuardEvent::CycleCompleted {
            cycle_no: cycle.cycle_no,
            outcome:  cycle.outcome,
            cycle:    Box::new(cycle.clone()),
        });
        if let CycleResult::Halted(reason) = &result {
            self.events.publish(GuardEvent::Halted { reason: reason.clone() });
        }
        self.history.write().await.push(cycle);

        result
    }

    fn halt(&self, reason: HaltReason) -> CycleResult {
        self.risk.halt(reason.clone());
        // The first reason wins if something else halted us meanwhile.
        CycleResult::Halted(self.risk.halt_reason().unwrap_or(reason))
    }

    // ─── Helpers ──────────────────────────────────────────────────────────────

    async fn observe(&self) -> Result<Decimal, GuardError> {
        with_retry("observe_position", &self.config.retry, || {
            self.exchange.observe_position(self.contract())
        })
        .await
    }

    async fn entry_request(&self) -> Result<OrderRequest, GuardError> {
        let cfg = &self.config;
        match cfg.entry_order {
            EntryOrder::Market => Ok(OrderRequest::market(&cfg.contract_id, cfg.side, cfg.quantity)),
            EntryOrder::Limit => {
                let quote = with_retry("best_bid_ask", &cfg.retry, || {
                    self.exchange.best_bid_ask(&cfg.contract_id)
                })
                .await?;
                // Rest on our own side of the book.
                let price = match cfg.side {
                    OrderSide::Buy  => quote.bid,
                    OrderSide::Sell => quote.ask,
                };
                Ok(OrderRequest::limit(&cfg.contract_id, cfg.side, cfg.quantity, price))
            }
        }
    }

    async fn hold(&self) {
        if self.config.hold.is_zero() {
            return;
        }
        info!(hold = ?self.config.hold, "⏸️ Holding position");
        tokio::select! {
            _ = tokio::time::sleep(self.config.hold) => {}
            _ = self.risk.halted() => warn!("Hold cut short by halt"),
        }
    }

    async fn cancel_quietly(&self, order_id: &OrderId) {
        if let Err(e) = with_retry("cancel_order", &self.config.retry, || self.exchange.cancel_order(order_id)).await {
            warn!(%order_id, error = %e, "Cancel failed; the gate will retry next cycle");
        }
    }

    /// Best-effort snapshot for halt diagnostics.
    async fn active_order_ids(&self) -> Vec<OrderId> {
        match self.exchange.list_active_orders(self.contract()).await {
            Ok(orders) => orders.into_iter().map(|o| o.order_id).collect(),
            Err(e) => {
                warn!(error = %e, "Could not list active orders for halt report");
                Vec::new()
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FillWaitConfig;
    use crate::engine::evidence::{EvidenceAggregator, FillEvidence};
    use crate::exchange::{FillScript, SimOp, SimulatedExchange};
    use crate::models::{CycleHistory, FillUpdate, OrderStatus};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn config() -> GuardConfig {
        GuardConfig {
            contract_id:    "ETH".into(),
            quantity:       dec!(0.05),
            fill: FillWaitConfig {
                max_wait:      Duration::from_secs(8),
                poll_interval: Duration::from_secs(2),
            },
            hold:           Duration::from_secs(5),
            cycle_interval: Duration::from_secs(1),
            ..GuardConfig::default()
        }
    }

    struct Harness {
        venue:      SimulatedExchange,
        evidence:   SharedEvidence,
        risk:       Arc<RiskManager>,
        history:    SharedHistory,
        controller: ReconciliationController,
    }

    fn harness(config: GuardConfig) -> Harness {
        let venue = SimulatedExchange::standalone();
        let evidence = EvidenceAggregator::shared();
        let risk = Arc::new(RiskManager::new(config.max_consecutive_failures));
        let history = CycleHistory::shared(16);
        let controller = ReconciliationController::new(
            Arc::new(config),
            Arc::new(venue.clone()),
            evidence.clone(),
            risk.clone(),
            history.clone(),
            EventBus::detached(),
        );
        Harness { venue, evidence, risk, history, controller }
    }

    fn entries(venue: &SimulatedExchange) -> Vec<OrderRequest> {
        venue.submissions().into_iter().filter(|r| !r.reduce_only).collect()
    }

    async fn last_cycle(h: &Harness) -> ReconciliationCycle {
        h.history.read().await.recent(1).remove(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_cycle_fills_holds_and_flattens() {
        let mut h = harness(config());

        assert_eq!(h.controller.run_cycle().await, CycleResult::Continued);

        let subs = h.venue.submissions();
        assert_eq!(subs.len(), 2);
        assert_eq!((subs[0].side, subs[0].reduce_only), (OrderSide::Buy, false));
        assert_eq!((subs[1].side, subs[1].quantity, subs[1].reduce_only), (OrderSide::Sell, dec!(0.05), true));
        assert_eq!(h.venue.position_now("ETH"), dec!(0));

        let cycle = last_cycle(&h).await;
        assert_eq!(cycle.outcome, CycleOutcome::Flat);
        assert_eq!(cycle.action, CycleAction::Submitted);
        assert_eq!(cycle.filled_quantity, Some(dec!(0.05)));
        assert_eq!(cycle.final_position, Some(dec!(0)));
        assert!(h.evidence.read().await.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_confirmation_submits_entry_once() {
        let mut h = harness(config());
        h.venue.push_script(FillScript::lagging_poll(Duration::from_secs(1), Duration::from_secs(6)));

        assert_eq!(h.controller.run_cycle().await, CycleResult::Continued);

        assert_eq!(entries(&h.venue).len(), 1);
        assert_eq!(last_cycle(&h).await.filled_quantity, Some(dec!(0.05)));
        assert_eq!(h.venue.position_now("ETH"), dec!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_stream_fill_settled_in_account_is_closed_not_resubmitted() {
        let mut h = harness(config());
        h.venue.push_script(
            FillScript::stream_only(Duration::from_secs(1)).with_position_after(Duration::from_secs(3)),
        );

        assert_eq!(h.controller.run_cycle().await, CycleResult::Continued);

        assert_eq!(entries(&h.venue).len(), 1);
        assert_eq!(h.venue.position_now("ETH"), dec!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_ambiguous_order_is_retried_at_most_once() {
        let mut h = harness(config());
        h.venue.push_script(FillScript::stream_only(Duration::from_secs(1)));
        h.venue.push_script(FillScript::stream_only(Duration::from_secs(1)));

        assert_eq!(h.controller.run_cycle().await, CycleResult::Continued);

        assert_eq!(entries(&h.venue).len(), 2);
        assert_eq!(h.venue.cancel_calls().len(), 2);
        assert_eq!(last_cycle(&h).await.outcome, CycleOutcome::Retry);
        assert_eq!(h.risk.status().await.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_at_loop_start_is_force_closed_by_measured_size() {
        let mut h = harness(config());
        h.venue.set_position("ETH", dec!(-0.2));

        assert_eq!(h.controller.run_cycle().await, CycleResult::Continued);

        let subs = h.venue.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!((subs[0].side, subs[0].quantity, subs[0].reduce_only), (OrderSide::Buy, dec!(0.2), true));

        let cycle = last_cycle(&h).await;
        assert_eq!(cycle.action, CycleAction::ForcedClose);
        assert_eq!(cycle.observed_position, Some(dec!(-0.2)));
        assert_eq!(cycle.final_position, Some(dec!(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_still_open_after_final_retry_halts() {
        let mut h = harness(config());
        h.venue.set_position("ETH", dec!(0.3));
        h.venue.set_default_script(FillScript::never());

        let CycleResult::Halted(reason) = h.controller.run_cycle().await else {
            panic!("expected HALTED");
        };
        assert_eq!(reason.cause, HaltCause::ResidualPosition);
        assert_eq!(reason.position, Some(dec!(0.3)));
        assert_eq!(h.venue.submissions().len(), 3);

        // Terminal: nothing else is submitted.
        assert!(h.controller.run_cycle().await.is_halted());
        assert_eq!(h.venue.submissions().len(), 3);
        assert_eq!(last_cycle(&h).await.outcome, CycleOutcome::Halted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_during_close_settlement_stops_further_attempts() {
        let mut h = harness(config());
        h.venue.set_position("ETH", dec!(0.3));
        h.venue.set_default_script(FillScript::never());

        let risk = h.risk.clone();
        tokio::spawn(async move {
            // Inside attempt 1's 3s settlement delay.
            tokio::time::sleep(Duration::from_millis(2500)).await;
            risk.halt(HaltReason::new(HaltCause::Manual, "operator"));
        });

        let CycleResult::Halted(reason) = h.controller.run_cycle().await else {
            panic!("expected HALTED");
        };
        assert_eq!(reason.cause, HaltCause::Manual);
        assert_eq!(h.venue.submissions().len(), 1);
        // The unfilled close order was pulled, not left resting.
        assert!(h.venue.list_active_orders("ETH").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dust_position_at_start_is_flat() {
        let mut h = harness(config());
        h.venue.set_position("ETH", dec!(0.0009));

        assert_eq!(h.controller.run_cycle().await, CycleResult::Continued);

        assert_eq!(entries(&h.venue).len(), 1);
        let cycle = last_cycle(&h).await;
        assert_eq!(cycle.action, CycleAction::Submitted);
        assert_eq!(cycle.observed_position, Some(dec!(0.0009)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncancelable_order_blocks_and_counts_failure() {
        let mut h = harness(config());
        h.venue.add_resting_order("ETH", OrderSide::Sell, dec!(1), false);

        assert_eq!(h.controller.run_cycle().await, CycleResult::Continued);

        assert!(h.venue.submissions().is_empty());
        assert_eq!(last_cycle(&h).await.outcome, CycleOutcome::Retry);
        assert_eq!(h.risk.status().await.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_halts() {
        let mut h = harness(GuardConfig { max_consecutive_failures: 2, ..config() });
        h.venue.fail_next(SimOp::Submit, 10);

        assert_eq!(h.controller.run_cycle().await, CycleResult::Continued);
        let CycleResult::Halted(reason) = h.controller.run_cycle().await else {
            panic!("expected HALTED");
        };
        assert_eq!(reason.cause, HaltCause::RetryBudgetExhausted);
        assert!(h.venue.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leftover_ambiguous_order_is_resolved_before_trading() {
        let mut h = harness(config());
        {
            let mut agg = h.evidence.write().await;
            agg.record(FillEvidence::from_stream(&FillUpdate {
                order_id:        OrderId::from("OLD-1"),
                contract_id:     "ETH".into(),
                status:          OrderStatus::Filled,
                filled_quantity: dec!(0.05),
                timestamp:       chrono::Utc::now(),
            }));
            agg.expire(&OrderId::from("OLD-1"));
        }

        assert_eq!(h.controller.run_cycle().await, CycleResult::Continued);

        assert!(h.venue.submissions().is_empty());
        assert!(h.evidence.read().await.unresolved_ambiguous("ETH").is_empty());
        assert_eq!(last_cycle(&h).await.action, CycleAction::ResolvedAmbiguous);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_after_loop_count() {
        let mut h = harness(GuardConfig { loop_count: Some(2), ..config() });

        assert_eq!(h.controller.run().await, None);
        assert_eq!(h.history.read().await.len(), 2);
        assert_eq!(entries(&h.venue).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_halt_stops_submissions() {
        let mut h = harness(config());
        let risk = h.risk.clone();
        tokio::spawn(async move {
            // Lands inside the first cycle's hold.
            tokio::time::sleep(Duration::from_secs(2)).await;
            risk.halt(HaltReason::new(HaltCause::Manual, "operator"));
        });

        let reason = h.controller.run().await.unwrap();
        assert_eq!(reason.cause, HaltCause::Manual);
        // Entry only; no close was sent after the halt.
        assert_eq!(h.venue.submissions().len(), 1);
    }
}
