//! # engine::evidence
//!
//! **Evidence Aggregator** — merges streaming-feed notifications and polled order
//! snapshots into one [`FillConfidence`] per order.
//!
//! ```text
//!                 stream FILLED              poll FILLED
//!  UNCONFIRMED ─────────────────▶ STREAM_SIGNALED ─────────────▶ API_CONFIRMED
//!       │                               │                              ▲
//!       │ poll FILLED                   │ wait expired                 │
//!       └───────────────────────────────┼──────────────────────────────┤
//!                                       ▼                              │
//!                               AMBIGUOUS_TIMEOUT ─────────────────────┘
//!                                              poll FILLED / position confirms
//! ```
//!
//! A stream fill alone is never "done": the feed can run ahead of account
//! settlement. And an expired wait with a stream fill on record is
//! `AmbiguousTimeout`, never "unfilled".

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::{FillUpdate, OrderId, OrderSnapshot, OrderStatus};

pub type SharedEvidence = Arc<RwLock<EvidenceAggregator>>;

// ─── Evidence ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceSource {
    Stream,
    Poll,
}

/// One observation about one order. Consumed by [`EvidenceAggregator::record`].
#[derive(Debug, Clone, PartialEq)]
pub struct FillEvidence {
    pub source:          EvidenceSource,
    pub order_id:        OrderId,
    pub contract_id:     String,
    pub observed_status: OrderStatus,
    pub filled_quantity: Decimal,
    pub timestamp:       DateTime<Utc>,
}

impl FillEvidence {
    pub fn from_stream(update: &FillUpdate) -> Self {
        Self {
            source:          EvidenceSource::Stream,
            order_id:        update.order_id.clone(),
            contract_id:     update.contract_id.clone(),
            observed_status: update.status,
            filled_quantity: update.filled_quantity,
            timestamp:       update.timestamp,
        }
    }

    pub fn from_poll(snapshot: &OrderSnapshot) -> Self {
        Self {
            source:          EvidenceSource::Poll,
            order_id:        snapshot.order_id.clone(),
            contract_id:     snapshot.contract_id.clone(),
            observed_status: snapshot.status,
            filled_quantity: snapshot.filled_quantity,
            timestamp:       Utc::now(),
        }
    }
}

// ─── FillConfidence ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillConfidence {
    Unconfirmed,
    StreamSignaled,
    ApiConfirmed,
    AmbiguousTimeout,
}

impl std::fmt::Display for FillConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FillConfidence::Unconfirmed      => "UNCONFIRMED",
            FillConfidence::StreamSignaled   => "STREAM_SIGNALED",
            FillConfidence::ApiConfirmed     => "API_CONFIRMED",
            FillConfidence::AmbiguousTimeout => "AMBIGUOUS_TIMEOUT",
        };
        f.write_str(s)
    }
}

// ─── Per-order state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct OrderEvidence {
    contract_id:   String,
    confidence:    FillConfidence,
    /// Stream statuses already consumed, for de-duplication.
    stream_seen:   HashSet<OrderStatus>,
    stream_filled: Decimal,
    api_filled:    Decimal,
    /// Last terminal status reported by the poll side (CANCELED / REJECTED).
    poll_terminal: Option<OrderStatus>,
    updated_at:    DateTime<Utc>,
}

impl OrderEvidence {
    fn new(contract_id: &str) -> Self {
        Self {
            contract_id:   contract_id.to_string(),
            confidence:    FillConfidence::Unconfirmed,
            stream_seen:   HashSet::new(),
            stream_filled: Decimal::ZERO,
            api_filled:    Decimal::ZERO,
            poll_terminal: None,
            updated_at:    Utc::now(),
        }
    }
}

/// Read-only view for the monitor API.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceView {
    pub order_id:        OrderId,
    pub contract_id:     String,
    pub confidence:      FillConfidence,
    pub filled_quantity: Decimal,
    pub updated_at:      DateTime<Utc>,
}

// ─── EvidenceAggregator ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct EvidenceAggregator {
    orders: HashMap<OrderId, OrderEvidence>,
}

impl EvidenceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedEvidence {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Starts tracking a freshly submitted order as `Unconfirmed`.
    pub fn track(&mut self, order_id: &OrderId, contract_id: &str) {
        self.orders
            .entry(order_id.clone())
            .or_insert_with(|| OrderEvidence::new(contract_id));
    }

    /// Folds one observation into the order's state and returns the new confidence.
    pub fn record(&mut self, evidence: FillEvidence) -> FillConfidence {
        let entry = self
            .orders
            .entry(evidence.order_id.clone())
            .or_insert_with(|| OrderEvidence::new(&evidence.contract_id));

        let before = entry.confidence;

        match evidence.source {
            EvidenceSource::Stream => {
                if !entry.stream_seen.insert(evidence.observed_status) {
                    debug!(order_id = %evidence.order_id, status = ?evidence.observed_status, "Duplicate stream evidence ignored");
                    return entry.confidence;
                }
                entry.stream_filled = entry.stream_filled.max(evidence.filled_quantity);

                if evidence.observed_status == OrderStatus::Filled
                    && entry.confidence == FillConfidence::Unconfirmed
                {
                    entry.confidence = FillConfidence::StreamSignaled;
                }
            }
            EvidenceSource::Poll => {
                entry.api_filled = entry.api_filled.max(evidence.filled_quantity);

                match evidence.observed_status {
                    OrderStatus::Filled => entry.confidence = FillConfidence::ApiConfirmed,
                    OrderStatus::Canceled | OrderStatus::Rejected => {
                        entry.poll_terminal = Some(evidence.observed_status);
                    }
                    _ => {}
                }
            }
        }
        entry.updated_at = evidence.timestamp;

        if entry.confidence != before {
            info!(
                order_id = %evidence.order_id,
                source   = ?evidence.source,
                from     = %before,
                to       = %entry.confidence,
                "Fill confidence changed"
            );
        }
        entry.confidence
    }

    pub fn current_confidence(&self, order_id: &OrderId) -> FillConfidence {
        self.orders
            .get(order_id)
            .map(|e| e.confidence)
            .unwrap_or(FillConfidence::Unconfirmed)
    }

    /// The bounded wait ran out. A stream fill on record becomes `AmbiguousTimeout`;
    /// anything else keeps its state.
    pub fn expire(&mut self, order_id: &OrderId) -> FillConfidence {
        let Some(entry) = self.orders.get_mut(order_id) else {
            return FillConfidence::Unconfirmed;
        };
        if entry.confidence == FillConfidence::StreamSignaled {
            entry.confidence = FillConfidence::AmbiguousTimeout;
            entry.updated_at = Utc::now();
            warn!(%order_id, "Stream reported a fill the account never confirmed → AMBIGUOUS_TIMEOUT");
        }
        entry.confidence
    }

    /// Terminal collapse after an authoritative re-observation proved the fill.
    pub fn confirm(&mut self, order_id: &OrderId, filled_quantity: Decimal) {
        if let Some(entry) = self.orders.get_mut(order_id) {
            entry.api_filled = entry.api_filled.max(filled_quantity);
            entry.confidence = FillConfidence::ApiConfirmed;
            entry.updated_at = Utc::now();
        }
    }

    /// Best known filled quantity: the account's view when it has one, else the stream's.
    pub fn filled_quantity(&self, order_id: &OrderId) -> Decimal {
        self.orders
            .get(order_id)
            .map(|e| if e.api_filled > Decimal::ZERO { e.api_filled } else { e.stream_filled })
            .unwrap_or_default()
    }

    /// CANCELED / REJECTED as reported by the poll side, if any.
    pub fn poll_terminal(&self, order_id: &OrderId) -> Option<OrderStatus> {
        self.orders.get(order_id).and_then(|e| e.poll_terminal)
    }

    /// Orders on `contract_id` still stuck in `AmbiguousTimeout`.
    pub fn unresolved_ambiguous(&self, contract_id: &str) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = self
            .orders
            .iter()
            .filter(|(_, e)| e.contract_id == contract_id && e.confidence == FillConfidence::AmbiguousTimeout)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drops an order once it is terminal and reconciled.
    pub fn forget(&mut self, order_id: &OrderId) {
        if self.orders.remove(order_id).is_some() {
            debug!(%order_id, "Order evidence released");
        }
    }

    pub fn snapshot(&self) -> Vec<EvidenceView> {
        let mut views: Vec<EvidenceView> = self
            .orders
            .iter()
            .map(|(id, e)| EvidenceView {
                order_id:        id.clone(),
                contract_id:     e.contract_id.clone(),
                confidence:      e.confidence,
                filled_quantity: if e.api_filled > Decimal::ZERO { e.api_filled } else { e.stream_filled },
                updated_at:      e.updated_at,
            })
            .collect();
        views.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        views
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn stream(id: &str, status: OrderStatus, qty: Decimal) -> FillEvidence {
        FillEvidence {
            source:          EvidenceSource::Stream,
            order_id:        OrderId::from(id),
            contract_id:     "ETH".into(),
            observed_status: status,
            filled_quantity: qty,
            timestamp:       Utc::now(),
        }
    }

    fn poll(id: &str, status: OrderStatus, qty: Decimal) -> FillEvidence {
        FillEvidence { source: EvidenceSource::Poll, ..stream(id, status, qty) }
    }

    #[test]
    fn test_stream_fill_alone_is_not_confirmation() {
        let mut agg = EvidenceAggregator::new();
        agg.track(&OrderId::from("A"), "ETH");

        let c = agg.record(stream("A", OrderStatus::Filled, dec!(0.05)));
        assert_eq!(c, FillConfidence::StreamSignaled);
        assert_eq!(agg.filled_quantity(&OrderId::from("A")), dec!(0.05));
    }

    #[test]
    fn test_poll_fill_is_authoritative_from_any_state() {
        let mut agg = EvidenceAggregator::new();
        assert_eq!(agg.record(poll("A", OrderStatus::Filled, dec!(1))), FillConfidence::ApiConfirmed);

        agg.record(stream("B", OrderStatus::Filled, dec!(1)));
        agg.expire(&OrderId::from("B"));
        assert_eq!(agg.record(poll("B", OrderStatus::Filled, dec!(1))), FillConfidence::ApiConfirmed);
    }

    #[test]
    fn test_expire_distinguishes_ambiguous_from_unfilled() {
        let mut agg = EvidenceAggregator::new();
        agg.track(&OrderId::from("quiet"), "ETH");
        agg.track(&OrderId::from("noisy"), "ETH");
        agg.record(stream("noisy", OrderStatus::Filled, dec!(1)));

        assert_eq!(agg.expire(&OrderId::from("quiet")), FillConfidence::Unconfirmed);
        assert_eq!(agg.expire(&OrderId::from("noisy")), FillConfidence::AmbiguousTimeout);
        assert_eq!(agg.unresolved_ambiguous("ETH"), vec![OrderId::from("noisy")]);
        assert!(agg.unresolved_ambiguous("BTC").is_empty());
    }

    #[test]
    fn test_confidence_never_downgrades() {
        let mut agg = EvidenceAggregator::new();
        agg.record(poll("A", OrderStatus::Filled, dec!(1)));
        // Late, out-of-order stream updates must not move it back.
        assert_eq!(agg.record(stream("A", OrderStatus::PartiallyFilled, dec!(0.4))), FillConfidence::ApiConfirmed);
        assert_eq!(agg.record(stream("A", OrderStatus::Filled, dec!(1))), FillConfidence::ApiConfirmed);
        assert_eq!(agg.expire(&OrderId::from("A")), FillConfidence::ApiConfirmed);
        assert_eq!(agg.filled_quantity(&OrderId::from("A")), dec!(1));
    }

    #[test]
    fn test_duplicate_stream_evidence_is_ignored() {
        let mut agg = EvidenceAggregator::new();
        agg.record(stream("A", OrderStatus::PartiallyFilled, dec!(0.3)));
        // Same (order_id, status) again with a different payload: dropped.
        agg.record(stream("A", OrderStatus::PartiallyFilled, dec!(0.9)));
        assert_eq!(agg.filled_quantity(&OrderId::from("A")), dec!(0.3));
        assert_eq!(agg.current_confidence(&OrderId::from("A")), FillConfidence::Unconfirmed);
    }

    #[test]
    fn test_poll_terminal_and_forget() {
        let mut agg = EvidenceAggregator::new();
        agg.record(poll("A", OrderStatus::Canceled, dec!(0)));
        assert_eq!(agg.poll_terminal(&OrderId::from("A")), Some(OrderStatus::Canceled));

        agg.forget(&OrderId::from("A"));
        assert_eq!(agg.poll_terminal(&OrderId::from("A")), None);
        assert_eq!(agg.current_confidence(&OrderId::from("A")), FillConfidence::Unconfirmed);
        assert!(agg.snapshot().is_empty());
    }

    #[test]
    fn test_confirm_collapses_ambiguous() {
        let mut agg = EvidenceAggregator::new();
        agg.record(stream("A", OrderStatus::Filled, dec!(0.05)));
        agg.expire(&OrderId::from("A"));
        agg.confirm(&OrderId::from("A"), dec!(0.05));
        assert_eq!(agg.current_confidence(&OrderId::from("A")), FillConfidence::ApiConfirmed);
        assert!(agg.unresolved_ambiguous("ETH").is_empty());
    }
}
