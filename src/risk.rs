//! # risk — Halt Switch + Retry Budget
//!
//! ชั้นกั้นสุดท้ายก่อนยิง Order
//!
//! ## ชั้นการป้องกัน
//! 1. **Halt Switch**    — หยุดระบบ (manual, close exhausted หรือ auto)
//! 2. **Retry Budget**   — Fail ติดต่อกัน N ครั้ง → `Exhausted` → controller HALTS
//!
//! The switch is a `watch` channel so long waits (fill wait, hold) can `select!` on
//! [`RiskManager::halted`] and stop the moment it trips. The first halt reason wins;
//! later ones are logged and dropped. There is no re-arm: a halted run ends, and the
//! operator restarts the service after fixing the account.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::models::HaltReason;

// ─── Internal State ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RiskInner {
    consecutive_failures: u32,
    total_failures:       u64,
    last_failure:         Option<String>,
    last_failure_at:      Option<DateTime<Utc>>,
}

// ─── Status (for API) ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub is_halted:                bool,
    pub halt_reason:              Option<HaltReason>,
    pub consecutive_failures:     u32,
    pub max_consecutive_failures: u32,
    pub total_failures:           u64,
    pub last_failure:             Option<String>,
    pub last_failure_at:          Option<DateTime<Utc>>,
}

// ─── Budget ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBudget {
    /// Still within budget; the cycle may be retried.
    Retry { consecutive: u32 },
    /// Budget spent. The caller must halt.
    Exhausted { consecutive: u32 },
}

// ─── Risk Manager ─────────────────────────────────────────────────────────────

pub struct RiskManager {
    inner:    Arc<RwLock<RiskInner>>,
    halt_tx:  watch::Sender<Option<HaltReason>>,
    max_consecutive_failures: u32,
}

impl RiskManager {
    /// `max_consecutive_failures == 0` disables the budget.
    pub fn new(max_consecutive_failures: u32) -> Self {
        let (halt_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(RwLock::new(RiskInner::default())),
            halt_tx,
            max_consecutive_failures,
        }
    }

    // ─── Halt Switch ──────────────────────────────────────────────────────────

    /// Trips the switch. Returns `false` if it was already tripped.
    pub fn halt(&self, reason: HaltReason) -> bool {
        let mut newly = false;
        self.halt_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            warn!(
                cause         = ?reason.cause,
                position      = ?reason.position,
                active_orders = ?reason.active_orders,
                "⛔ HALTED: {}", reason.message
            );
            *current = Some(reason.clone());
            newly = true;
            true
        });
        if !newly {
            info!(cause = ?reason.cause, "Halt requested while already halted: {}", reason.message);
        }
        newly
    }

    pub fn is_halted(&self) -> bool {
        self.halt_tx.borrow().is_some()
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.halt_tx.borrow().clone()
    }

    /// Resolves once the switch is tripped (immediately if it already is).
    pub async fn halted(&self) -> HaltReason {
        let mut rx = self.halt_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            // Sender lives as long as `self`; unreachable in practice.
            None => std::future::pending().await,
        }
    }

    // ─── Result Recording ─────────────────────────────────────────────────────

    /// A cycle ended cleanly.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        let prev = inner.consecutive_failures;
        inner.consecutive_failures = 0;
        if prev > 0 {
            info!("Risk: consecutive_failures reset (was {prev})");
        }
    }

    /// A non-fatal failure. `Exhausted` means the caller must halt.
    pub async fn record_failure(&self, what: &str) -> FailureBudget {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures += 1;
        inner.total_failures += 1;
        inner.last_failure    = Some(what.to_string());
        inner.last_failure_at = Some(Utc::now());
        let consecutive = inner.consecutive_failures;

        warn!(
            consecutive,
            max = self.max_consecutive_failures,
            "⚠️ Risk: failure recorded: {what}"
        );

        if self.max_consecutive_failures > 0 && consecutive >= self.max_consecutive_failures {
            FailureBudget::Exhausted { consecutive }
        } else {
            FailureBudget::Retry { consecutive }
        }
    }

    // ─── Status ───────────────────────────────────────────────────────────────

    pub async fn status(&self) -> RiskStatus {
        let inner = self.inner.read().await;
        RiskStatus {
            is_halted:                self.is_halted(),
            halt_reason:              self.halt_reason(),
            consecutive_failures:     inner.consecutive_failures,
            max_consecutive_failures: self.max_consecutive_failures,
            total_failures:           inner.total_failures,
            last_failure:             inner.last_failure.clone(),
            last_failure_at:          inner.last_failure_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HaltCause;
    use std::time::Duration;

    #[tokio::test]
    async fn test_budget_exhaustion_is_reported() {
        let risk = RiskManager::new(2);
        assert_eq!(risk.record_failure("submit").await, FailureBudget::Retry { consecutive: 1 });
        assert_eq!(risk.record_failure("submit").await, FailureBudget::Exhausted { consecutive: 2 });
        // Halting is the caller's call, with the state it observed.
        assert!(!risk.is_halted());
    }

    #[tokio::test]
    async fn test_zero_budget_never_exhausts() {
        let risk = RiskManager::new(0);
        for _ in 0..10 {
            assert!(matches!(risk.record_failure("x").await, FailureBudget::Retry { .. }));
        }
    }

    #[tokio::test]
    async fn test_success_resets_budget() {
        let risk = RiskManager::new(2);
        risk.record_failure("gate").await;
        risk.record_success().await;
        assert_eq!(risk.record_failure("gate").await, FailureBudget::Retry { consecutive: 1 });

        let status = risk.status().await;
        assert_eq!(status.total_failures, 2);
        assert_eq!(status.last_failure.as_deref(), Some("gate"));
    }

    #[tokio::test]
    async fn test_first_halt_reason_wins() {
        let risk = RiskManager::new(0);
        assert!(risk.halt(HaltReason::new(HaltCause::Manual, "operator")));
        assert!(!risk.halt(HaltReason::new(HaltCause::CloseFailed, "later")));
        assert_eq!(risk.halt_reason().unwrap().message, "operator");
        assert!(risk.status().await.is_halted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halted_wakes_waiters() {
        let risk = Arc::new(RiskManager::new(0));
        let waiter = {
            let risk = risk.clone();
            tokio::spawn(async move { risk.halted().await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        risk.halt(HaltReason::new(HaltCause::Manual, "stop"));
        let reason = waiter.await.unwrap();
        assert_eq!(reason.cause, HaltCause::Manual);
    }
}
