//! # engine
//!
//! Fill detection, position reconciliation and safe close.
//!
//! - [`evidence`]    — merges stream and poll evidence into a `FillConfidence` per order
//! - [`fill_waiter`] — bounded wait on one order, three-way outcome
//! - [`gate`]        — mandatory pre-submission check against live exchange state
//! - [`close`]       — closes by measured position, bounded retries
//! - [`controller`]  — the per-cycle state machine tying the above together

pub mod close;
pub mod controller;
pub mod evidence;
pub mod fill_waiter;
pub mod gate;

pub use close::{emergency_close, CloseExecutor, CloseOutcome};
pub use controller::ReconciliationController;
pub use evidence::{EvidenceAggregator, FillConfidence, FillEvidence, SharedEvidence};
pub use fill_waiter::{FillOutcome, FillWaiter, SubmittedOrder};
pub use gate::{BlockReason, GateDecision, OrderGate};
