//! Domain models shared across the guard.

pub mod cycle;
pub mod order;
pub mod position;

pub use cycle::{
    CycleAction, CycleHistory, CycleOutcome, CycleResult, HaltCause, HaltReason,
    ReconciliationCycle, SharedHistory,
};
pub use order::{
    CancelOutcome, FillUpdate, OrderId, OrderKind, OrderRequest, OrderSide, OrderSnapshot,
    OrderStatus, Quote,
};
pub use position::{is_flat, Position, POSITION_EPSILON};
