//! # events
//!
//! Defines [`GuardEvent`], every event the guard broadcasts to the `/ws/monitor`
//! stream, and [`EventBus`], the handle engine components publish through.
//!
//! Events go out as pre-serialized JSON on a `broadcast::Sender<String>`, which keeps
//! the channel free of `Clone` bounds on the payload types.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::engine::fill_waiter::FillOutcome;
use crate::engine::gate::BlockReason;
use crate::models::{CycleOutcome, HaltReason, OrderId, OrderRequest, ReconciliationCycle};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardEvent {
    CycleStarted {
        cycle_no:    u64,
        contract_id: String,
    },

    /// Order Gate refused a submission.
    GateBlocked {
        cycle_no:    u64,
        contract_id: String,
        reason:      BlockReason,
    },

    OrderSubmitted {
        cycle_no: u64,
        order_id: OrderId,
        request:  Box<OrderRequest>,
    },

    FillResolved {
        order_id: OrderId,
        outcome:  FillOutcome,
    },

    CloseAttempted {
        contract_id: String,
        attempt:     u32,
        position:    Decimal,
        order_id:    Option<OrderId>,
    },

    /// Position re-observed after the settlement delay.
    CloseVerified {
        contract_id: String,
        attempt:     u32,
        position:    Decimal,
        flat:        bool,
    },

    CycleCompleted {
        cycle_no: u64,
        outcome:  CycleOutcome,
        cycle:    Box<ReconciliationCycle>,
    },

    Halted {
        reason: HaltReason,
    },
}

impl GuardEvent {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

/// Cheap-to-clone publisher over the monitor channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<String>,
}

impl EventBus {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }

    /// Bus with its own channel, for tools and tests that have no monitor.
    pub fn detached() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// No subscribers is not an error.
    pub fn publish(&self, event: GuardEvent) {
        let json = event.to_json();
        if self.tx.send(json).is_err() {
            debug!("No monitor subscribers; event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HaltCause;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_tag_format() {
        let json = GuardEvent::CloseVerified {
            contract_id: "ETH".into(),
            attempt:     1,
            position:    dec!(0),
            flat:        true,
        }
        .to_json();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["event"], "CLOSE_VERIFIED");
        assert_eq!(v["flat"], true);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::detached();
        bus.publish(GuardEvent::CycleStarted { cycle_no: 1, contract_id: "ETH".into() });

        let mut rx = bus.subscribe();
        bus.publish(GuardEvent::Halted { reason: HaltReason::new(HaltCause::Manual, "stop") });

        let v: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(v["event"], "HALTED");
        assert_eq!(v["reason"]["cause"], "MANUAL");
    }
}
