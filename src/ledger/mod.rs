//! # ledger — durable store port
//!
//! The transactional surface the engine needs from the position/order/
//! account store, plus the pure settlement helpers both adapters share.
//!
//! ## Adapters
//! - [`postgres::PgLedger`] — sqlx/PostgreSQL, the production store; the
//!   close protocol runs inside one transaction keyed on
//!   `pg_try_advisory_xact_lock`
//! - [`memory::MemLedger`] — in-memory store with the same try-lock
//!   semantics; powers `LEDGER_BACKEND=memory` and the test suite
//!
//! ## The close contract
//! At most one successful close per position, ever, regardless of how many
//! actors (tick worker, scheduled trigger, user action) race on it. Losing
//! the race is a *success-shaped no-op*: `skipped = true` with a reason,
//! never an error.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    Heartbeat, HeartbeatRole, Order, OrderSide, OrderStatus, Position, ProductType, RiskAlert,
    TradingAccount,
};

// ─── Close request / outcome ──────────────────────────────────────────────────

/// What initiated a close. Recorded on the exit order and in the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseTrigger {
    Manual,
    StopLoss,
    Target,
    RiskAutoClose,
}

impl CloseTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseTrigger::Manual => "MANUAL",
            CloseTrigger::StopLoss => "STOP_LOSS",
            CloseTrigger::Target => "TARGET",
            CloseTrigger::RiskAutoClose => "RISK_AUTO_CLOSE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub position_id: Uuid,
    pub account_id:  Uuid,
    /// The tick worker always passes its freshly computed current price to
    /// spare a second quote round-trip; non-positive values are ignored.
    pub exit_price_override: Option<f64>,
    pub trigger: CloseTrigger,
}

/// Why a close was a no-op. Both are expected outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another actor holds the close lock right now.
    LockNotAcquired,
    /// Quantity was already zero under the lock.
    AlreadyClosed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::LockNotAcquired => "lock_not_acquired",
            SkipReason::AlreadyClosed => "already_closed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseOutcome {
    pub position_id:     Uuid,
    pub skipped:         bool,
    pub reason:          Option<SkipReason>,
    pub exit_order_id:   Option<Uuid>,
    pub realized_pnl:    f64,
    pub exit_price:      f64,
    pub margin_released: f64,
    /// Populated on a successful close, for event routing.
    pub user_id: Option<Uuid>,
    pub symbol:  Option<String>,
}

impl CloseOutcome {
    pub fn skipped(position_id: Uuid, reason: SkipReason) -> Self {
        Self {
            position_id,
            skipped: true,
            reason: Some(reason),
            exit_order_id: None,
            realized_pnl: 0.0,
            exit_price: 0.0,
            margin_released: 0.0,
            user_id: None,
            symbol: None,
        }
    }
}

// ─── Port ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Open positions (quantity != 0), oldest first, bounded batch.
    async fn open_positions(&self, limit: i64) -> Result<Vec<Position>, EngineError>;

    async fn position(&self, id: Uuid) -> Result<Option<Position>, EngineError>;

    async fn accounts_by_ids(&self, ids: &[Uuid]) -> Result<Vec<TradingAccount>, EngineError>;

    /// Persist fresh marks on one open position.
    async fn update_position_marks(
        &self,
        id: Uuid,
        unrealized_pnl: f64,
        day_pnl: f64,
        last_price: f64,
    ) -> Result<(), EngineError>;

    /// The atomic settle-and-close operation (ten steps, one transaction).
    async fn close_position(&self, req: &CloseRequest) -> Result<CloseOutcome, EngineError>;

    /// Insert `alert` unless the account already alerted within
    /// `cooldown_secs`. Returns whether a row was written.
    async fn try_insert_risk_alert(
        &self,
        alert: &RiskAlert,
        cooldown_secs: i64,
    ) -> Result<bool, EngineError>;

    async fn write_heartbeat(
        &self,
        role: HeartbeatRole,
        heartbeat: &Heartbeat,
    ) -> Result<(), EngineError>;

    async fn read_heartbeat(
        &self,
        role: HeartbeatRole,
    ) -> Result<Option<Heartbeat>, EngineError>;
}

// ─── Pure settlement helpers ──────────────────────────────────────────────────

/// Stable advisory-lock key for one position: both 8-byte halves of the UUID
/// folded together, so a difference anywhere in the id changes the key. Must
/// be identical for every process that may race on the close.
pub fn close_lock_key(position_id: Uuid) -> i64 {
    let bytes = position_id.as_bytes();
    let mut head = [0u8; 8];
    let mut tail = [0u8; 8];
    head.copy_from_slice(&bytes[..8]);
    tail.copy_from_slice(&bytes[8..]);
    i64::from_le_bytes(head) ^ i64::from_le_bytes(tail)
}

/// Realized P&L locked in at close. Signed quantity keeps this side-agnostic.
#[inline]
pub fn realized_pnl(exit_price: f64, average_price: f64, quantity: i64) -> f64 {
    (exit_price - average_price) * quantity as f64
}

/// Exit price fallback chain: override (if positive) → last known instrument
/// price → average entry price. `None` means the close must fail loudly.
pub fn resolve_exit_price(
    exit_price_override: Option<f64>,
    last_price: Option<f64>,
    average_price: f64,
) -> Option<f64> {
    exit_price_override
        .filter(|p| *p > 0.0)
        .or(last_price.filter(|p| *p > 0.0))
        .or(if average_price > 0.0 { Some(average_price) } else { None })
}

/// Recover the product type used at entry from the account's executed orders
/// for this symbol, so the margin released mirrors the margin blocked.
///
/// Preference order: the most recent executed order whose side would reduce
/// this position → the most recent executed order for the symbol → Delivery
/// (the conservative full-margin default). `orders` must be sorted most
/// recent first.
pub fn pick_entry_product(orders: &[Order], position_quantity: i64) -> ProductType {
    let reducing_side = if position_quantity > 0 {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    };

    let executed = || orders.iter().filter(|o| o.status == OrderStatus::Executed);

    if let Some(order) = executed().find(|o| o.side == reducing_side) {
        return order.product_type;
    }
    if let Some(order) = executed().next() {
        return order.product_type;
    }
    ProductType::Delivery
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn order(side: OrderSide, product: ProductType, status: OrderStatus) -> Order {
        Order {
            id: Uuid::new_v4(),
            account_id: Uuid::from_u128(1),
            symbol: "INFY".into(),
            side,
            quantity: 10,
            price: 100.0,
            product_type: product,
            status,
            executed_at: Some(Utc::now()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn lock_key_is_stable_and_distinct() {
        let a = Uuid::from_u128(7);
        assert_eq!(close_lock_key(a), close_lock_key(a));
        // Ids differing only in the low half must not share a lock...
        assert_ne!(close_lock_key(a), close_lock_key(Uuid::from_u128(8)));
        // ...and neither must ids differing only in the high half.
        assert_ne!(
            close_lock_key(Uuid::from_u128(7 << 64)),
            close_lock_key(Uuid::from_u128(8 << 64))
        );
    }

    #[test]
    fn exit_price_chain() {
        assert_eq!(resolve_exit_price(Some(105.0), Some(102.0), 100.0), Some(105.0));
        // Non-positive override falls through.
        assert_eq!(resolve_exit_price(Some(0.0), Some(102.0), 100.0), Some(102.0));
        assert_eq!(resolve_exit_price(None, None, 100.0), Some(100.0));
        assert_eq!(resolve_exit_price(None, Some(-1.0), 0.0), None);
    }

    #[test]
    fn realized_pnl_signs() {
        assert_eq!(realized_pnl(95.0, 100.0, 50), -250.0);
        assert_eq!(realized_pnl(95.0, 100.0, -50), 250.0);
        assert_eq!(realized_pnl(100.0, 100.0, 50), 0.0);
    }

    #[test]
    fn entry_product_prefers_reducing_side() {
        // Long position: a SELL intraday order marks the entry product even
        // when a newer BUY delivery order exists.
        let orders = vec![
            order(OrderSide::Buy, ProductType::Delivery, OrderStatus::Executed),
            order(OrderSide::Sell, ProductType::Intraday, OrderStatus::Executed),
        ];
        assert_eq!(pick_entry_product(&orders, 10), ProductType::Intraday);
        // Short position reduces with BUY.
        assert_eq!(pick_entry_product(&orders, -10), ProductType::Delivery);
    }

    #[test]
    fn entry_product_falls_back_to_latest_then_delivery() {
        let orders = vec![order(OrderSide::Buy, ProductType::Intraday, OrderStatus::Executed)];
        assert_eq!(pick_entry_product(&orders, 10), ProductType::Intraday);

        // Pending orders never count.
        let pending = vec![order(OrderSide::Sell, ProductType::Intraday, OrderStatus::Pending)];
        assert_eq!(pick_entry_product(&pending, 10), ProductType::Delivery);
        assert_eq!(pick_entry_product(&[], 10), ProductType::Delivery);
    }
}
