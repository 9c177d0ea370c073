//! # fillguard
//!
//! Fill detection, position reconciliation and safe close for an automated
//! trading loop.
//!
//! ```text
//!  ┌──────────────┐ stream fills  ┌───────────────────────────────────────────┐
//!  │ Exchange     │ ────────────▶ │ ReconciliationController                  │
//!  │ (bridge/sim) │ ◀──────────── │ ├─ EvidenceAggregator  stream ⊕ poll       │
//!  └──────────────┘ poll/submit/  │ ├─ FillWaiter          3-way outcome       │
//!                   cancel/pos    │ ├─ OrderGate           no blind submits    │
//!                                 │ ├─ CloseExecutor       measured close      │
//!                                 │ └─ RiskManager  ⛔      halt + retry budget │
//!                                 └───────────────────────┬───────────────────┘
//!  ┌──────────────┐ ws://host/ws/monitor                   │ GuardEvent
//!  │  Operator    │ ◀──────────────────────────────────────┘
//!  └──────────────┘ POST /api/guard/halt · /api/guard/emergency-close
//! ```

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange;
pub mod models;
pub mod risk;
pub mod routes;
pub mod state;
