//! # exchange::simulated
//!
//! **Simulated venue** — an in-memory exchange whose fills follow a per-order script.
//!
//! Each submitted order consumes the next [`FillScript`] (or the default one). The
//! script says *when* each kind of evidence appears, measured from submission:
//!
//! ```text
//! submit ──┬── stream_after   → FillUpdate pushed on the fill channel
//!          ├── poll_after     → order_status() reports FILLED / PARTIALLY_FILLED
//!          └── position_after → observe_position() includes the fill
//! ```
//!
//! The three are independent on purpose: a stream that runs ahead of settlement, or
//! a stream notification that never shows up in the account, is exactly what the
//! guard has to survive. Time is `tokio::time::Instant`, so paused-clock tests are
//! deterministic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::exchange::{Exchange, ExchangeError, FillSubscription};
use crate::models::{
    CancelOutcome, FillUpdate, OrderId, OrderKind, OrderRequest, OrderSide, OrderSnapshot,
    OrderStatus, Quote,
};

// ─── FillScript ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct FillScript {
    /// Fraction of the requested quantity that fills. `0` = never fills.
    pub fill_ratio:     Decimal,
    pub stream_after:   Option<Duration>,
    pub poll_after:     Option<Duration>,
    pub position_after: Option<Duration>,
    /// Push the stream notification twice.
    pub duplicate_stream: bool,
    pub cancelable:     bool,
}

impl FillScript {
    /// Fills at once, visible everywhere.
    pub fn immediate() -> Self {
        Self {
            fill_ratio:       Decimal::ONE,
            stream_after:     Some(Duration::ZERO),
            poll_after:       Some(Duration::ZERO),
            position_after:   Some(Duration::ZERO),
            duplicate_stream: false,
            cancelable:       true,
        }
    }

    /// Stream first, then the account catches up at `poll` (position settles then too).
    pub fn lagging_poll(stream: Duration, poll: Duration) -> Self {
        Self {
            stream_after:   Some(stream),
            poll_after:     Some(poll),
            position_after: Some(poll),
            ..Self::immediate()
        }
    }

    /// Stream says filled; the order API never does.
    pub fn stream_only(stream: Duration) -> Self {
        Self {
            stream_after:   Some(stream),
            poll_after:     None,
            position_after: None,
            ..Self::immediate()
        }
    }

    /// Rests on the book forever.
    pub fn never() -> Self {
        Self {
            fill_ratio:     Decimal::ZERO,
            stream_after:   None,
            poll_after:     None,
            position_after: None,
            ..Self::immediate()
        }
    }

    pub fn with_position_after(mut self, after: Duration) -> Self {
        self.position_after = Some(after);
        self
    }

    pub fn with_fill_ratio(mut self, ratio: Decimal) -> Self {
        self.fill_ratio = ratio;
        self
    }

    pub fn with_duplicate_stream(mut self) -> Self {
        self.duplicate_stream = true;
        self
    }

    pub fn uncancelable(mut self) -> Self {
        self.cancelable = false;
        self
    }
}

impl Default for FillScript {
    fn default() -> Self {
        Self::immediate()
    }
}

// ─── Failure injection ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    ObservePosition,
    ListOrders,
    OrderStatus,
    Cancel,
    Submit,
    Quote,
}

// ─── Internal State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimOrder {
    request:      OrderRequest,
    order_id:     OrderId,
    submitted_at: Instant,
    script:       FillScript,
    canceled_at:  Option<Instant>,
}

impl SimOrder {
    fn filled_quantity(&self) -> Decimal {
        self.request.quantity * self.script.fill_ratio
    }

    /// Whether an effect scheduled `after` submission has happened by `now`
    /// and was not voided by an earlier cancel.
    fn reached(&self, after: Option<Duration>, now: Instant) -> bool {
        match after {
            Some(d) if self.script.fill_ratio > Decimal::ZERO => {
                let at = self.submitted_at + d;
                at <= now && self.canceled_at.map_or(true, |c| at <= c)
            }
            _ => false,
        }
    }

    fn snapshot(&self, now: Instant) -> OrderSnapshot {
        let fill_visible = self.reached(self.script.poll_after, now);
        let filled = if fill_visible { self.filled_quantity() } else { Decimal::ZERO };

        let status = if self.canceled_at.is_some() {
            OrderStatus::Canceled
        } else if fill_visible && self.script.fill_ratio >= Decimal::ONE {
            OrderStatus::Filled
        } else if fill_visible {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::New
        };

        OrderSnapshot {
            order_id:        self.order_id.clone(),
            contract_id:     self.request.contract_id.clone(),
            side:            self.request.side,
            quantity:        self.request.quantity,
            filled_quantity: filled,
            status,
            price:           match self.request.kind {
                OrderKind::Limit { price } => Some(price),
                OrderKind::Market => None,
            },
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    base_positions: HashMap<String, Decimal>,
    orders:         Vec<SimOrder>,
    scripts:        VecDeque<FillScript>,
    default_script: FillScript,
    failures:       HashMap<SimOp, u32>,
    reject_market:  bool,
    quote:          Option<Quote>,
    next_id:        u64,
    submissions:    Vec<OrderRequest>,
    cancels:        Vec<OrderId>,
}

impl SimState {
    fn take_failure(&mut self, op: SimOp) -> Result<(), ExchangeError> {
        match self.failures.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(ExchangeError::Transport(format!("injected failure on {op:?}")))
            }
            _ => Ok(()),
        }
    }

    fn position(&self, contract_id: &str, now: Instant) -> Decimal {
        let base = self.base_positions.get(contract_id).copied().unwrap_or_default();
        self.orders
            .iter()
            .filter(|o| o.request.contract_id == contract_id)
            .filter(|o| o.reached(o.script.position_after, now))
            .fold(base, |acc, o| acc + o.request.side.sign() * o.filled_quantity())
    }
}

// ─── SimulatedExchange ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SimulatedExchange {
    state:    Arc<Mutex<SimState>>,
    fills_tx: broadcast::Sender<FillUpdate>,
}

impl SimulatedExchange {
    pub fn new(fills_tx: broadcast::Sender<FillUpdate>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            fills_tx,
        }
    }

    /// Standalone venue with its own fill channel.
    pub fn standalone() -> Self {
        let (tx, _) = broadcast::channel(super::FILL_CHANNEL_CAPACITY);
        Self::new(tx)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Scenario setup ────────────────────────────────────────────────────────

    /// Sets the position that exists independently of any simulated order.
    pub fn set_position(&self, contract_id: &str, quantity: Decimal) {
        let now = Instant::now();
        let mut state = self.lock();
        let from_orders = state.position(contract_id, now)
            - state.base_positions.get(contract_id).copied().unwrap_or_default();
        state.base_positions.insert(contract_id.to_string(), quantity - from_orders);
    }

    pub fn push_script(&self, script: FillScript) {
        self.lock().scripts.push_back(script);
    }

    pub fn set_default_script(&self, script: FillScript) {
        self.lock().default_script = script;
    }

    pub fn fail_next(&self, op: SimOp, times: u32) {
        *self.lock().failures.entry(op).or_default() += times;
    }

    pub fn reject_market_orders(&self, reject: bool) {
        self.lock().reject_market = reject;
    }

    pub fn set_quote(&self, bid: Decimal, ask: Decimal) {
        self.lock().quote = Some(Quote { bid, ask });
    }

    /// A resting order that did not come from the guard (stale order from a crash, manual order...).
    pub fn add_resting_order(&self, contract_id: &str, side: OrderSide, quantity: Decimal, cancelable: bool) -> OrderId {
        let script = if cancelable { FillScript::never() } else { FillScript::never().uncancelable() };
        let mut state = self.lock();
        state.next_id += 1;
        let order_id = OrderId(format!("SIM-{}", state.next_id));
        state.orders.push(SimOrder {
            request:      OrderRequest::limit(contract_id, side, quantity, Decimal::ONE_HUNDRED),
            order_id:     order_id.clone(),
            submitted_at: Instant::now(),
            script,
            canceled_at:  None,
        });
        order_id
    }

    /// Injects a raw stream notification.
    pub fn push_fill(&self, update: FillUpdate) {
        let _ = self.fills_tx.send(update);
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn submissions(&self) -> Vec<OrderRequest> {
        self.lock().submissions.clone()
    }

    pub fn cancel_calls(&self) -> Vec<OrderId> {
        self.lock().cancels.clone()
    }

    pub fn position_now(&self, contract_id: &str) -> Decimal {
        self.lock().position(contract_id, Instant::now())
    }

    fn spawn_stream(&self, order: &SimOrder) {
        let Some(after) = order.script.stream_after else { return };

        let filled = if order.script.fill_ratio > Decimal::ZERO {
            order.filled_quantity()
        } else {
            order.request.quantity
        };
        let status = if order.script.fill_ratio > Decimal::ZERO && order.script.fill_ratio < Decimal::ONE {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Filled
        };
        let update = FillUpdate {
            order_id:        order.order_id.clone(),
            contract_id:     order.request.contract_id.clone(),
            status,
            filled_quantity: filled,
            timestamp:       chrono::Utc::now(),
        };
        let copies = if order.script.duplicate_stream { 2 } else { 1 };
        let tx = self.fills_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            for _ in 0..copies {
                let _ = tx.send(update.clone());
            }
            debug!(order_id = %update.order_id, "Simulated stream fill pushed");
        });
    }
}

#[async_trait]
impl Exchange for SimulatedExchange {
    async fn observe_position(&self, contract_id: &str) -> Result<Decimal, ExchangeError> {
        let mut state = self.lock();
        state.take_failure(SimOp::ObservePosition)?;
        Ok(state.position(contract_id, Instant::now()))
    }

    async fn list_active_orders(&self, contract_id: &str) -> Result<Vec<OrderSnapshot>, ExchangeError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.take_failure(SimOp::ListOrders)?;
        Ok(state
            .orders
            .iter()
            .filter(|o| o.request.contract_id == contract_id)
            .map(|o| o.snapshot(now))
            .filter(|s| s.status.is_active())
            .collect())
    }

    async fn order_status(&self, order_id: &OrderId) -> Result<Option<OrderSnapshot>, ExchangeError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.take_failure(SimOp::OrderStatus)?;
        Ok(state
            .orders
            .iter()
            .find(|o| &o.order_id == order_id)
            .map(|o| o.snapshot(now)))
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<CancelOutcome, ExchangeError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.take_failure(SimOp::Cancel)?;
        state.cancels.push(order_id.clone());

        let Some(order) = state.orders.iter_mut().find(|o| &o.order_id == order_id) else {
            return Ok(CancelOutcome::AlreadyResolved);
        };
        if order.snapshot(now).status.is_terminal() {
            return Ok(CancelOutcome::AlreadyResolved);
        }
        if !order.script.cancelable {
            return Err(ExchangeError::Rejected(format!("order {order_id} cannot be canceled")));
        }

        order.canceled_at = Some(now);
        info!(%order_id, "Simulated order canceled");
        Ok(CancelOutcome::Canceled)
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderId, ExchangeError> {
        let order = {
            let mut state = self.lock();
            state.take_failure(SimOp::Submit)?;
            if state.reject_market && request.kind == OrderKind::Market {
                return Err(ExchangeError::Rejected("market orders not supported".into()));
            }

            state.next_id += 1;
            let script = match state.scripts.pop_front() {
                Some(script) => script,
                None => state.default_script.clone(),
            };
            let order = SimOrder {
                request:      request.clone(),
                order_id:     OrderId(format!("SIM-{}", state.next_id)),
                submitted_at: Instant::now(),
                script,
                canceled_at:  None,
            };
            state.submissions.push(request.clone());
            state.orders.push(order.clone());
            order
        };

        self.spawn_stream(&order);
        info!(order_id = %order.order_id, side = %request.side, quantity = %request.quantity, "Simulated order accepted");
        Ok(order.order_id)
    }

    async fn best_bid_ask(&self, _contract_id: &str) -> Result<Quote, ExchangeError> {
        let mut state = self.lock();
        state.take_failure(SimOp::Quote)?;
        Ok(state.quote.unwrap_or(Quote {
            bid: Decimal::ONE_HUNDRED,
            ask: Decimal::ONE_HUNDRED + Decimal::ONE,
        }))
    }

    fn subscribe_fills(&self, contract_id: &str) -> FillSubscription {
        FillSubscription::new(contract_id, self.fills_tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test(start_paused = true)]
    async fn test_lagging_poll_timeline() {
        let venue = SimulatedExchange::standalone();
        venue.push_script(FillScript::lagging_poll(Duration::from_secs(1), Duration::from_secs(6)));
        let mut fills = venue.subscribe_fills("ETH");

        let id = venue
            .submit_order(&OrderRequest::market("ETH", OrderSide::Buy, dec!(0.05)))
            .await
            .unwrap();

        let update = fills.next().await.unwrap();
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(venue.order_status(&id).await.unwrap().unwrap().status, OrderStatus::New);
        assert_eq!(venue.observe_position("ETH").await.unwrap(), dec!(0));

        tokio::time::sleep(Duration::from_secs(6)).await;
        let snap = venue.order_status(&id).await.unwrap().unwrap();
        assert_eq!(snap.status, OrderStatus::Filled);
        assert_eq!(snap.filled_quantity, dec!(0.05));
        assert_eq!(venue.observe_position("ETH").await.unwrap(), dec!(0.05));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_voids_pending_fill() {
        let venue = SimulatedExchange::standalone();
        venue.push_script(FillScript::lagging_poll(Duration::from_secs(5), Duration::from_secs(5)));
        let id = venue
            .submit_order(&OrderRequest::market("ETH", OrderSide::Sell, dec!(1)))
            .await
            .unwrap();

        assert_eq!(venue.cancel_order(&id).await.unwrap(), CancelOutcome::Canceled);
        assert_eq!(venue.cancel_order(&id).await.unwrap(), CancelOutcome::AlreadyResolved);
        assert_eq!(venue.cancel_order(&OrderId::from("nope")).await.unwrap(), CancelOutcome::AlreadyResolved);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(venue.observe_position("ETH").await.unwrap(), dec!(0));
        assert!(venue.list_active_orders("ETH").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_position_and_uncancelable_resting_order() {
        let venue = SimulatedExchange::standalone();
        venue.set_position("ETH", dec!(-0.2));
        let id = venue.add_resting_order("ETH", OrderSide::Buy, dec!(1), false);

        assert_eq!(venue.observe_position("ETH").await.unwrap(), dec!(-0.2));
        assert!(venue.cancel_order(&id).await.is_err());
        assert_eq!(venue.list_active_orders("ETH").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_and_market_rejection() {
        let venue = SimulatedExchange::standalone();
        venue.fail_next(SimOp::ObservePosition, 1);
        assert!(venue.observe_position("ETH").await.unwrap_err().is_transient());
        assert!(venue.observe_position("ETH").await.is_ok());

        venue.reject_market_orders(true);
        let err = venue
            .submit_order(&OrderRequest::market("ETH", OrderSide::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));
        assert!(venue.submissions().is_empty());
    }
}
