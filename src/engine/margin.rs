//! # engine::margin — Margin Calculator
//!
//! Pure and deterministic. The same function runs at both call sites —
//! margin *block* when a position opens and margin *release* when it closes
//! — so the two can never drift apart as long as both derive the product
//! type the same way (see `ledger::pick_entry_product`).

use crate::models::{ProductType, Segment};

// ─── Leverage policy ──────────────────────────────────────────────────────────

/// Intraday equity runs at high leverage.
const EQUITY_INTRADAY_LEVERAGE: f64 = 5.0;
/// Intraday derivatives get a lower multiple than equity.
const DERIVATIVES_INTRADAY_LEVERAGE: f64 = 2.0;
/// Delivery blocks full notional.
const DELIVERY_LEVERAGE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginRequirement {
    pub required_margin: f64,
    pub leverage:        f64,
}

/// Margin required to hold `quantity` units at `price`.
///
/// Derivative quantity is expressed in lots, so the notional multiplies by
/// `lot_size`; equity quantity is already in shares. Turnover = units ×
/// price; required = turnover / leverage.
pub fn required_margin(
    segment: Segment,
    product_type: ProductType,
    quantity: i64,
    price: f64,
    lot_size: i64,
) -> MarginRequirement {
    let leverage = match (segment, product_type) {
        (Segment::Equity, ProductType::Intraday) => EQUITY_INTRADAY_LEVERAGE,
        (Segment::Derivatives, ProductType::Intraday) => DERIVATIVES_INTRADAY_LEVERAGE,
        (_, ProductType::Delivery) => DELIVERY_LEVERAGE,
    };

    let units = match segment {
        Segment::Equity => quantity.unsigned_abs() as f64,
        Segment::Derivatives => (quantity.unsigned_abs() * lot_size.unsigned_abs()) as f64,
    };

    let turnover = units * price.max(0.0);

    MarginRequirement {
        required_margin: turnover / leverage,
        leverage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_blocks_full_notional() {
        // Delivery equity, qty=10 @ 100 → margin 1000, leverage 1.
        let m = required_margin(Segment::Equity, ProductType::Delivery, 10, 100.0, 1);
        assert_eq!(m.required_margin, 1000.0);
        assert_eq!(m.leverage, 1.0);
    }

    #[test]
    fn intraday_equity_is_materially_cheaper() {
        let delivery = required_margin(Segment::Equity, ProductType::Delivery, 10, 100.0, 1);
        let intraday = required_margin(Segment::Equity, ProductType::Intraday, 10, 100.0, 1);
        assert!(intraday.required_margin < delivery.required_margin);
        assert_eq!(intraday.required_margin, 200.0);
        assert_eq!(intraday.leverage, 5.0);
    }

    #[test]
    fn derivatives_multiply_by_lot_size() {
        // 2 lots of a 50-unit contract @ 200 → turnover 20_000, leverage 2.
        let m = required_margin(Segment::Derivatives, ProductType::Intraday, 2, 200.0, 50);
        assert_eq!(m.required_margin, 10_000.0);
        assert_eq!(m.leverage, 2.0);
    }

    #[test]
    fn sign_and_garbage_inputs_are_neutralised() {
        // Quantity sign never matters — margin is on absolute exposure.
        let long = required_margin(Segment::Equity, ProductType::Delivery, 10, 100.0, 1);
        let short = required_margin(Segment::Equity, ProductType::Delivery, -10, 100.0, 1);
        assert_eq!(long, short);

        // Negative price clamps to zero turnover rather than negative margin.
        let m = required_margin(Segment::Equity, ProductType::Delivery, 10, -5.0, 1);
        assert_eq!(m.required_margin, 0.0);
    }
}
