//! # engine::pricing — Quote Normalizer & P&L math
//!
//! Pure functions, error-free by construction: every path produces a safe
//! fallback value. P&L must never be computed against a non-positive
//! reference price — degrading to the average entry price yields *zero* P&L,
//! which is the correct default under data loss (no spurious spikes).

use crate::quotes::Quote;

// ─── Resolution ───────────────────────────────────────────────────────────────

/// The single price pair one tick of one position is marked against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPrices {
    pub current:    f64,
    pub prev_close: f64,
}

/// Resolve `(current, prev_close)` from the available sources.
///
/// Current price: live last-trade (if > 0) → last known instrument price
/// (if > 0) → average entry price → 0.
/// Previous close: live prev-close (if > 0) → average entry price → 0.
pub fn resolve_prices(
    live: Option<&Quote>,
    last_known: Option<f64>,
    average_price: f64,
) -> ResolvedPrices {
    let current = live
        .map(|q| q.last_trade_price)
        .filter(|p| *p > 0.0)
        .or(last_known.filter(|p| *p > 0.0))
        .or(positive(average_price))
        .unwrap_or(0.0);

    let prev_close = live
        .map(|q| q.prev_close_price)
        .filter(|p| *p > 0.0)
        .or(positive(average_price))
        .unwrap_or(0.0);

    ResolvedPrices { current, prev_close }
}

#[inline]
fn positive(p: f64) -> Option<f64> {
    if p > 0.0 {
        Some(p)
    } else {
        None
    }
}

// ─── P&L formulas ─────────────────────────────────────────────────────────────

/// Mark-to-market P&L on an open position. Signed quantity makes this
/// formula side-agnostic: shorts profit when `current < average`.
#[inline]
pub fn unrealized_pnl(current: f64, average: f64, quantity: i64) -> f64 {
    (current - average) * quantity as f64
}

/// P&L measured against the previous session's close.
#[inline]
pub fn day_pnl(current: f64, prev_close: f64, quantity: i64) -> f64 {
    (current - prev_close) * quantity as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_quote_wins() {
        let q = Quote::new(105.0, 102.0);
        let r = resolve_prices(Some(&q), Some(104.0), 100.0);
        assert_eq!(r.current, 105.0);
        assert_eq!(r.prev_close, 102.0);
    }

    #[test]
    fn falls_back_to_last_known_then_average() {
        // Non-positive live prices are treated as absent.
        let q = Quote::new(0.0, -1.0);
        let r = resolve_prices(Some(&q), Some(104.0), 100.0);
        assert_eq!(r.current, 104.0);
        assert_eq!(r.prev_close, 100.0);

        let r = resolve_prices(None, None, 100.0);
        assert_eq!(r.current, 100.0);
        assert_eq!(r.prev_close, 100.0);
    }

    #[test]
    fn everything_gone_resolves_to_zero() {
        let r = resolve_prices(None, Some(-3.0), 0.0);
        assert_eq!(r.current, 0.0);
        assert_eq!(r.prev_close, 0.0);
    }

    #[test]
    fn average_fallback_yields_zero_pnl() {
        // The safe default under total data loss: P&L flat, not spiking.
        let r = resolve_prices(None, None, 250.0);
        assert_eq!(unrealized_pnl(r.current, 250.0, 40), 0.0);
        assert_eq!(day_pnl(r.current, r.prev_close, 40), 0.0);
    }

    #[test]
    fn pnl_is_side_aware_via_signed_quantity() {
        // Long 50 @ 100, price 95 → -250.
        assert_eq!(unrealized_pnl(95.0, 100.0, 50), -250.0);
        // Short -10 @ 100, price 95 → +50.
        assert_eq!(unrealized_pnl(95.0, 100.0, -10), 50.0);
        assert_eq!(day_pnl(98.0, 100.0, -10), 20.0);
    }
}
