//! # models::position
//!
//! Position snapshots as observed on the exchange.
//!
//! The guard never owns a position. It only reads snapshots and moves the real
//! position by submitting orders, so a [`Position`] is always "what the venue said
//! at `observed_at`", never local belief.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::OrderSide;

/// Magnitude below which a position is flat. Every component uses this value.
pub const POSITION_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

/// `true` when `|quantity| < POSITION_EPSILON`.
#[inline]
pub fn is_flat(quantity: Decimal) -> bool {
    quantity.abs() < POSITION_EPSILON
}

/// Signed position snapshot: `+` long, `-` short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub contract_id: String,
    pub quantity:    Decimal,
    pub observed_at: DateTime<Utc>,
}

impl Position {
    pub fn new(contract_id: impl Into<String>, quantity: Decimal) -> Self {
        Self {
            contract_id: contract_id.into(),
            quantity,
            observed_at: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        is_flat(self.quantity)
    }

    /// Side of the order that would bring this position back to zero.
    /// `None` when already flat.
    pub fn closing_side(&self) -> Option<OrderSide> {
        if self.is_flat() {
            return None;
        }
        let held = if self.quantity > Decimal::ZERO { OrderSide::Buy } else { OrderSide::Sell };
        Some(held.opposite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_epsilon_boundary() {
        assert!(is_flat(dec!(0)));
        assert!(is_flat(dec!(0.0009)));
        assert!(is_flat(dec!(-0.0009)));
        assert!(!is_flat(dec!(0.001)));
        assert!(!is_flat(dec!(-0.001)));
        assert_eq!(POSITION_EPSILON, dec!(0.001));
    }

    #[test]
    fn test_closing_side() {
        assert_eq!(Position::new("X", dec!(0.2)).closing_side(), Some(OrderSide::Sell));
        assert_eq!(Position::new("X", dec!(-0.2)).closing_side(), Some(OrderSide::Buy));
        assert_eq!(Position::new("X", dec!(0.0004)).closing_side(), None);
    }
}
