//! # engine::close
//!
//! **Close Executor** — flattens a contract by what the account *actually* holds.
//!
//! Never closes by the strategy's intended size. Every attempt:
//! 1. observe position (flat → `Closed`, nothing submitted)
//! 2. cancel stale orders, re-observe
//! 3. reduce-only close for `|position|` on the opposite side
//!    (attempt 1: market; market rejected or attempt > 1: aggressive limit)
//! 4. settlement delay, re-observe → `Closed` | `StillOpen(residual)`
//!
//! [`CloseExecutor::close_with_retries`] bounds the attempts; deciding to halt on
//! what is left belongs to the controller. An executor built [`with_halt`] stops
//! submitting as soon as the switch trips and reports what it last measured.
//! [`emergency_close`] runs without it: the operator halts first, then flattens.
//!
//! [`with_halt`]: CloseExecutor::with_halt

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{CloseConfig, GuardConfig};
use crate::engine::gate::cancel_active_orders;
use crate::error::GuardError;
use crate::events::{EventBus, GuardEvent};
use crate::exchange::{with_retry, Exchange, ExchangeError, RetryPolicy};
use crate::models::{is_flat, OrderId, OrderRequest, OrderSide, Position};
use crate::risk::RiskManager;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseOutcome {
    Closed,
    StillOpen(Decimal),
    Error(String),
}

impl CloseOutcome {
    pub fn is_closed(&self) -> bool {
        matches!(self, CloseOutcome::Closed)
    }
}

pub struct CloseExecutor {
    exchange:      Arc<dyn Exchange>,
    retry:         RetryPolicy,
    config:        CloseConfig,
    cancel_settle: Duration,
    events:        EventBus,
    /// Halt switch honoured between attempts and during settlement.
    halt:          Option<Arc<RiskManager>>,
}

impl CloseExecutor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        retry: RetryPolicy,
        config: CloseConfig,
        cancel_settle: Duration,
        events: EventBus,
    ) -> Self {
        Self { exchange, retry, config, cancel_settle, events, halt: None }
    }

    pub fn with_halt(mut self, risk: Arc<RiskManager>) -> Self {
        self.halt = Some(risk);
        self
    }

    fn is_halted(&self) -> bool {
        self.halt.as_ref().is_some_and(|risk| risk.is_halted())
    }

    pub fn from_config(exchange: Arc<dyn Exchange>, config: &GuardConfig, events: EventBus) -> Self {
        Self::new(exchange, config.retry, config.close, config.cancel_settle, events)
    }

    /// Up to `max_attempts` close attempts; returns the first `Closed` or the last failure.
    pub async fn close_with_retries(&self, contract_id: &str) -> CloseOutcome {
        let max = self.config.max_attempts.max(1);
        let mut last = CloseOutcome::Error("no close attempt made".to_string());

        for attempt in 1..=max {
            if self.is_halted() {
                let outcome = if attempt == 1 { self.measure(contract_id).await } else { last };
                warn!(contract_id, attempt, outcome = ?outcome, "Close stopped by halt");
                return outcome;
            }

            last = self.close_position(contract_id, attempt).await;
            match &last {
                CloseOutcome::Closed => return last,
                CloseOutcome::StillOpen(residual) => {
                    warn!(contract_id, attempt, max, %residual, "Close attempt left a position");
                }
                CloseOutcome::Error(e) => {
                    warn!(contract_id, attempt, max, error = %e, "Close attempt failed");
                }
            }
        }

        error!(contract_id, attempts = max, outcome = ?last, "🛑 Close retries exhausted");
        last
    }

    /// One close attempt. `attempt` (1-based) scales the limit-price aggression.
    pub async fn close_position(&self, contract_id: &str, attempt: u32) -> CloseOutcome {
        match self.try_close(contract_id, attempt).await {
            Ok(outcome) => outcome,
            Err(e) => CloseOutcome::Error(e.to_string()),
        }
    }

    async fn try_close(&self, contract_id: &str, attempt: u32) -> Result<CloseOutcome, GuardError> {
        let position = self.observe(contract_id).await?;
        if is_flat(position) {
            info!(contract_id, %position, "Already flat, nothing to close");
            return Ok(CloseOutcome::Closed);
        }

        let stale = cancel_active_orders(self.exchange.as_ref(), contract_id, &self.retry, self.cancel_settle).await?;
        if !stale.is_empty() {
            return Err(GuardError::UncancelableOrders {
                contract_id: contract_id.to_string(),
                order_ids:   stale,
            });
        }

        // Canceled orders may have filled on the way out.
        let position = Position::new(contract_id, self.observe(contract_id).await?);
        let Some(side) = position.closing_side() else {
            info!(contract_id, position = %position.quantity, "Flat after cancellations");
            return Ok(CloseOutcome::Closed);
        };
        let quantity = position.quantity.abs();

        info!(
            contract_id,
            attempt,
            position = %position.quantity,
            %side,
            %quantity,
            "🔻 Closing position"
        );

        let order_id = self.submit_close(contract_id, side, quantity, attempt).await?;
        self.events.publish(GuardEvent::CloseAttempted {
            contract_id: contract_id.to_string(),
            attempt,
            position:    position.quantity,
            order_id:    Some(order_id.clone()),
        });

        self.settle().await;

        let residual = self.observe(contract_id).await?;
        let flat = is_flat(residual);
        self.events.publish(GuardEvent::CloseVerified {
            contract_id: contract_id.to_string(),
            attempt,
            position:    residual,
            flat,
        });

        if flat {
            info!(contract_id, attempt, %residual, %order_id, "✅ Position closed");
            return Ok(CloseOutcome::Closed);
        }

        // A resting close order must not outlive the attempt.
        if let Err(e) = with_retry("cancel_order", &self.retry, || self.exchange.cancel_order(&order_id)).await {
            warn!(%order_id, error = %e, "Could not cancel unfilled close order");
        }
        Ok(CloseOutcome::StillOpen(residual))
    }

    async fn submit_close(
        &self,
        contract_id: &str,
        side: OrderSide,
        quantity: Decimal,
        attempt: u32,
    ) -> Result<OrderId, GuardError> {
        // Submits are never retried: a timed-out submit may have reached the venue.
        let single = self.retry.single();

        if attempt <= 1 {
            let market = OrderRequest::market(contract_id, side, quantity).reduce_only();
            match with_retry("submit_order", &single, || self.exchange.submit_order(&market)).await {
                Ok(order_id) => return Ok(order_id),
                Err(GuardError::Exchange(ExchangeError::Rejected(msg) | ExchangeError::Unsupported(msg))) => {
                    warn!(contract_id, reason = %msg, "Market close refused, falling back to limit");
                }
                Err(e) => return Err(e),
            }
        }

        let quote = with_retry("best_bid_ask", &self.retry, || self.exchange.best_bid_ask(contract_id)).await?;
        let offset = self.config.limit_offset * Decimal::from(attempt.max(1));
        let price = match side {
            OrderSide::Sell => (quote.bid - offset).max(Decimal::ZERO),
            OrderSide::Buy  => quote.ask + offset,
        };

        info!(contract_id, %side, %quantity, %price, attempt, "Aggressive limit close");
        let limit = OrderRequest::limit(contract_id, side, quantity, price).reduce_only();
        with_retry("submit_order", &single, || self.exchange.submit_order(&limit)).await
    }

    async fn settle(&self) {
        let sleep = tokio::time::sleep(self.config.settlement_delay);
        match &self.halt {
            Some(risk) => tokio::select! {
                _ = sleep => {}
                _ = risk.halted() => warn!("Settlement cut short by halt"),
            },
            None => sleep.await,
        }
    }

    /// Position as it stands, in outcome form. No orders are sent.
    async fn measure(&self, contract_id: &str) -> CloseOutcome {
        match self.observe(contract_id).await {
            Ok(p) if is_flat(p) => CloseOutcome::Closed,
            Ok(p) => CloseOutcome::StillOpen(p),
            Err(e) => CloseOutcome::Error(e.to_string()),
        }
    }

    async fn observe(&self, contract_id: &str) -> Result<Decimal, GuardError> {
        with_retry("observe_position", &self.retry, || self.exchange.observe_position(contract_id)).await
    }
}

/// Out-of-band manual recovery: flatten `contract_id` independently of any control loop.
pub async fn emergency_close(
    exchange: Arc<dyn Exchange>,
    config: &GuardConfig,
    contract_id: &str,
    events: EventBus,
) -> CloseOutcome {
    warn!(contract_id, "🚨 EMERGENCY CLOSE requested");
    let executor = CloseExecutor::from_config(exchange, config, events);
    let outcome = executor.close_with_retries(contract_id).await;
    match &outcome {
        CloseOutcome::Closed => info!(contract_id, "🚨 Emergency close: flat"),
        other => error!(contract_id, outcome = ?other, "🚨 Emergency close: manual intervention required"),
    }
    outcome
}

// ─── Tests ────────────────────────────────────────────────────────────────────
