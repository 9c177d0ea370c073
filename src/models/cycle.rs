//! # models::cycle
//!
//! Audit record for one control-loop iteration, plus the results the controller
//! hands back to its caller.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::models::OrderId;

// ─── CycleAction ──────────────────────────────────────────────────────────────

/// What the controller ended up doing in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleAction {
    /// Nothing got past the gate.
    None,
    /// Position found at loop start and force-closed instead of trading.
    ForcedClose,
    /// Entry order submitted (and, if filled, closed at the end of the hold).
    Submitted,
    /// An ambiguous fill from an earlier order was resolved by re-observation.
    ResolvedAmbiguous,
}

// ─── CycleOutcome ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleOutcome {
    /// Cycle still running.
    Open,
    /// Ended flat with nothing left in flight.
    Flat,
    /// Ended without trading; counted against the retry budget.
    Retry,
    Halted,
}

// ─── ReconciliationCycle ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationCycle {
    pub cycle_no:          u64,
    pub contract_id:       String,
    pub started_at:        DateTime<Utc>,
    pub finished_at:       Option<DateTime<Utc>>,
    /// Position the strategy intends to hold once the entry fills.
    pub expected_position: Decimal,
    /// Position the venue reported at CLEANUP.
    pub observed_position: Option<Decimal>,
    /// Position the venue reported when the cycle closed.
    pub final_position:    Option<Decimal>,
    pub filled_quantity:   Option<Decimal>,
    pub order_ids:         Vec<OrderId>,
    pub action:            CycleAction,
    pub outcome:           CycleOutcome,
    pub note:              Option<String>,
}

impl ReconciliationCycle {
    pub fn start(cycle_no: u64, contract_id: &str, expected_position: Decimal) -> Self {
        Self {
            cycle_no,
            contract_id:       contract_id.to_string(),
            started_at:        Utc::now(),
            finished_at:       None,
            expected_position,
            observed_position: None,
            final_position:    None,
            filled_quantity:   None,
            order_ids:         Vec::new(),
            action:            CycleAction::None,
            outcome:           CycleOutcome::Open,
            note:              None,
        }
    }

    pub fn finish(&mut self, outcome: CycleOutcome, note: Option<String>) {
        self.outcome     = outcome;
        self.finished_at = Some(Utc::now());
        if let Some(note) = note {
            self.note = Some(note);
        }
    }
}

// ─── CycleHistory ─────────────────────────────────────────────────────────────

pub type SharedHistory = Arc<RwLock<CycleHistory>>;

/// Bounded audit ring, newest last.
#[derive(Debug)]
pub struct CycleHistory {
    cycles:   VecDeque<ReconciliationCycle>,
    capacity: usize,
}

impl CycleHistory {
    pub const DEFAULT_CAPACITY: usize = 200;

    pub fn new(capacity: usize) -> Self {
        Self {
            cycles:   VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn shared(capacity: usize) -> SharedHistory {
        Arc::new(RwLock::new(Self::new(capacity)))
    }

    pub fn push(&mut self, cycle: ReconciliationCycle) {
        if self.cycles.len() == self.capacity {
            self.cycles.pop_front();
        }
        self.cycles.push_back(cycle);
    }

    /// Up to `limit` most recent cycles, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ReconciliationCycle> {
        self.cycles.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }
}

// ─── HaltReason ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HaltCause {
    /// Close retries exhausted and the position is still open.
    ResidualPosition,
    /// Close could not be verified (errors on every attempt).
    CloseFailed,
    /// Too many consecutive non-fatal failures.
    RetryBudgetExhausted,
    /// Kill switch from an operator.
    Manual,
}

/// Why the loop stopped, with the state observed at the moment of the decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HaltReason {
    pub cause:         HaltCause,
    pub message:       String,
    pub position:      Option<Decimal>,
    pub active_orders: Vec<OrderId>,
    pub at:            DateTime<Utc>,
}

impl HaltReason {
    pub fn new(cause: HaltCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message:       message.into(),
            position:      None,
            active_orders: Vec::new(),
            at:            Utc::now(),
        }
    }

    pub fn with_state(mut self, position: Option<Decimal>, active_orders: Vec<OrderId>) -> Self {
        self.position      = position;
        self.active_orders = active_orders;
        self
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.cause, self.message)
    }
}

// ─── CycleResult ──────────────────────────────────────────────────────────────

/// Returned by `run_cycle`. `Halted` is terminal for the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleResult {
    Continued,
    Halted(HaltReason),
}

impl CycleResult {
    pub fn is_halted(&self) -> bool {
        matches!(self, CycleResult::Halted(_))
    }
}
