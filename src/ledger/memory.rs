//! # ledger::memory — in-memory adapter
//!
//! Same contract as the PostgreSQL adapter, backed by a `Mutex`-guarded
//! store and an explicit held-locks set that reproduces the non-blocking
//! try-lock semantics of the advisory lock. Powers `LEDGER_BACKEND=memory`
//! (local development without a database) and the whole test suite.
//!
//! The close is split into two critical sections — acquire, then settle —
//! so a racing caller observes `lock_not_acquired` exactly like it would
//! against PostgreSQL.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::engine::margin::required_margin;
use crate::error::EngineError;
use crate::ledger::{
    pick_entry_product, realized_pnl, resolve_exit_price, CloseOutcome, CloseRequest, Ledger,
    SkipReason,
};
use crate::models::{
    Heartbeat, HeartbeatRole, Order, OrderStatus, Position, RiskAlert, TradingAccount,
};

// ─── Store ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemInner {
    positions:  HashMap<Uuid, Position>,
    orders:     Vec<Order>,
    accounts:   HashMap<Uuid, TradingAccount>,
    alerts:     Vec<RiskAlert>,
    heartbeats: HashMap<HeartbeatRole, Heartbeat>,
    /// Positions whose close is in flight — the advisory-lock stand-in.
    close_locks: HashSet<Uuid>,
}

#[derive(Default, Clone)]
pub struct MemLedger {
    inner: Arc<Mutex<MemInner>>,
}

impl MemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Seeding / inspection (mock mode and tests) ────────────────────────────

    pub fn upsert_account(&self, account: TradingAccount) {
        let mut inner = self.inner.lock();
        inner.accounts.insert(account.id, account);
    }

    pub fn upsert_position(&self, position: Position) {
        let mut inner = self.inner.lock();
        inner.positions.insert(position.id, position);
    }

    pub fn insert_order(&self, order: Order) {
        let mut inner = self.inner.lock();
        inner.orders.push(order);
    }

    pub fn get_position(&self, id: Uuid) -> Option<Position> {
        let inner = self.inner.lock();
        inner.positions.get(&id).cloned()
    }

    pub fn get_account(&self, id: Uuid) -> Option<TradingAccount> {
        let inner = self.inner.lock();
        inner.accounts.get(&id).cloned()
    }

    pub fn orders_for(&self, account_id: Uuid, symbol: &str) -> Vec<Order> {
        let inner = self.inner.lock();
        inner
            .orders
            .iter()
            .filter(|o| o.account_id == account_id && o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn alerts(&self) -> Vec<RiskAlert> {
        let inner = self.inner.lock();
        inner.alerts.clone()
    }
}

// ─── Lock guard ───────────────────────────────────────────────────────────────

/// Releases the close lock on drop so an error path can never leak it.
struct CloseLockGuard {
    inner:       Arc<Mutex<MemInner>>,
    position_id: Uuid,
}

impl Drop for CloseLockGuard {
    fn drop(&mut self) {
        self.inner.lock().close_locks.remove(&self.position_id);
    }
}

// ─── Ledger impl ──────────────────────────────────────────────────────────────

#[async_trait]
impl Ledger for MemLedger {
    async fn open_positions(&self, limit: i64) -> Result<Vec<Position>, EngineError> {
        let inner = self.inner.lock();
        let mut open: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        open.truncate(limit.max(0) as usize);
        Ok(open)
    }

    async fn position(&self, id: Uuid) -> Result<Option<Position>, EngineError> {
        Ok(self.get_position(id))
    }

    async fn accounts_by_ids(&self, ids: &[Uuid]) -> Result<Vec<TradingAccount>, EngineError> {
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.accounts.get(id).cloned())
            .collect())
    }

    async fn update_position_marks(
        &self,
        id: Uuid,
        unrealized_pnl: f64,
        day_pnl: f64,
        last_price: f64,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if let Some(p) = inner.positions.get_mut(&id) {
            if p.is_open() {
                p.unrealized_pnl = unrealized_pnl;
                p.day_pnl = day_pnl;
                p.last_price = Some(last_price);
                p.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn close_position(&self, req: &CloseRequest) -> Result<CloseOutcome, EngineError> {
        // ── 1. Try-lock ───────────────────────────────────────────────────────
        {
            let mut inner = self.inner.lock();
            if !inner.close_locks.insert(req.position_id) {
                return Ok(CloseOutcome::skipped(req.position_id, SkipReason::LockNotAcquired));
            }
        }
        let _guard = CloseLockGuard {
            inner: Arc::clone(&self.inner),
            position_id: req.position_id,
        };

        // Let a racing task actually observe the held lock.
        tokio::task::yield_now().await;

        // ── 2..10. Settle under the lock ──────────────────────────────────────
        let mut inner = self.inner.lock();

        let position = inner
            .positions
            .get(&req.position_id)
            .filter(|p| p.account_id == req.account_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "position {} for account {}",
                    req.position_id, req.account_id
                ))
            })?;

        if position.quantity == 0 {
            return Ok(CloseOutcome::skipped(req.position_id, SkipReason::AlreadyClosed));
        }

        let exit_price = resolve_exit_price(
            req.exit_price_override,
            position.last_price,
            position.average_price,
        )
        .ok_or_else(|| {
            EngineError::QuoteUnavailable(format!(
                "position {}: no override, last price or entry price to settle against",
                position.id
            ))
        })?;

        let pnl = realized_pnl(exit_price, position.average_price, position.quantity);

        let mut entry_orders: Vec<Order> = inner
            .orders
            .iter()
            .filter(|o| {
                o.account_id == req.account_id
                    && o.symbol == position.symbol
                    && o.status == OrderStatus::Executed
            })
            .cloned()
            .collect();
        entry_orders.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        let product = pick_entry_product(&entry_orders, position.quantity);

        let margin_released = required_margin(
            position.segment,
            product,
            position.quantity,
            position.average_price,
            position.lot_size,
        )
        .required_margin;

        let now = Utc::now();
        let exit_order_id = Uuid::new_v4();
        let exit_order = Order {
            id: exit_order_id,
            account_id: req.account_id,
            symbol: position.symbol.clone(),
            side: position.exit_side(),
            quantity: position.quantity.unsigned_abs() as i64,
            price: exit_price,
            product_type: product,
            status: OrderStatus::Executed,
            executed_at: Some(now),
            created_at: now,
        };
        inner.orders.push(exit_order);

        if let Some(p) = inner.positions.get_mut(&req.position_id) {
            p.quantity = 0;
            p.realized_pnl = Some(pnl);
            p.unrealized_pnl = 0.0;
            p.last_price = Some(exit_price);
            p.closed_at = Some(now);
            p.updated_at = now;
        }

        if let Some(a) = inner.accounts.get_mut(&req.account_id) {
            a.available_margin += margin_released;
            a.used_margin = (a.used_margin - margin_released).max(0.0);
            a.balance += pnl;
        }

        Ok(CloseOutcome {
            position_id: position.id,
            skipped: false,
            reason: None,
            exit_order_id: Some(exit_order_id),
            realized_pnl: pnl,
            exit_price,
            margin_released,
            user_id: Some(position.user_id),
            symbol: Some(position.symbol),
        })
    }

    async fn try_insert_risk_alert(
        &self,
        alert: &RiskAlert,
        cooldown_secs: i64,
    ) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock();
        let cutoff = alert.created_at - chrono::Duration::seconds(cooldown_secs);
        let throttled = inner
            .alerts
            .iter()
            .any(|a| a.account_id == alert.account_id && a.created_at > cutoff);
        if throttled {
            return Ok(false);
        }
        inner.alerts.push(alert.clone());
        Ok(true)
    }

    async fn write_heartbeat(
        &self,
        role: HeartbeatRole,
        heartbeat: &Heartbeat,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        inner.heartbeats.insert(role, heartbeat.clone());
        Ok(())
    }

    async fn read_heartbeat(
        &self,
        role: HeartbeatRole,
    ) -> Result<Option<Heartbeat>, EngineError> {
        let inner = self.inner.lock();
        Ok(inner.heartbeats.get(&role).cloned())
    }
}
