//! # models::order
//!
//! Orders as submitted to, and reported back by, the exchange.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ─── OrderId ──────────────────────────────────────────────────────────────────

/// Venue-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ─── OrderSide ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy  => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// `+1` for buys, `-1` for sells: the sign a fill adds to the position.
    pub fn sign(self) -> Decimal {
        match self {
            OrderSide::Buy  => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy  => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" | "long"   => Ok(OrderSide::Buy),
            "sell" | "short" => Ok(OrderSide::Sell),
            other => Err(format!("unknown order side '{other}'")),
        }
    }
}

// ─── OrderStatus ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    /// The order can no longer change on the venue.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected)
    }

    /// Still resting (or unknown) on the book.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

// ─── OrderKind ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit { price: Decimal },
}

// ─── OrderRequest ─────────────────────────────────────────────────────────────

/// Payload for `submit_order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub contract_id: String,
    pub side:        OrderSide,
    pub quantity:    Decimal,
    pub kind:        OrderKind,
    /// Close orders may only shrink the position.
    pub reduce_only: bool,
    /// Client tag for tracing a venue order back to a cycle.
    pub client_tag:  String,
}

impl OrderRequest {
    pub fn market(contract_id: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            contract_id: contract_id.to_string(),
            side,
            quantity,
            kind:        OrderKind::Market,
            reduce_only: false,
            client_tag:  format!("FG-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    pub fn limit(contract_id: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            kind: OrderKind::Limit { price },
            ..Self::market(contract_id, side, quantity)
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

// ─── OrderSnapshot ────────────────────────────────────────────────────────────

/// One order as the venue reports it right now (polled).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id:        OrderId,
    pub contract_id:     String,
    pub side:            OrderSide,
    pub quantity:        Decimal,
    #[serde(default)]
    pub filled_quantity: Decimal,
    pub status:          OrderStatus,
    #[serde(default)]
    pub price:           Option<Decimal>,
}

// ─── FillUpdate ───────────────────────────────────────────────────────────────

/// Push notification from the streaming feed. May arrive late, out of order or twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillUpdate {
    pub order_id:        OrderId,
    pub contract_id:     String,
    pub status:          OrderStatus,
    #[serde(default)]
    pub filled_quantity: Decimal,
    #[serde(default = "Utc::now")]
    pub timestamp:       DateTime<Utc>,
}

// ─── CancelOutcome ────────────────────────────────────────────────────────────

/// Cancellation is idempotent: an order that is already gone is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelOutcome {
    Canceled,
    AlreadyResolved,
}

// ─── Quote ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}
