//! # ledger::postgres — PostgreSQL adapter
//!
//! Uses `sqlx` for async PostgreSQL. The close protocol is one transaction
//! bracketed by `pg_try_advisory_xact_lock` — the lock never blocks and is
//! released automatically at commit/rollback, which is exactly the mutual
//! exclusion the close contract needs across worker, cron and user actions.
//!
//! ## Setup
//! 1. Create a database and set `DATABASE_URL` in `.env`
//! 2. The embedded migration runs on startup

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::engine::margin::required_margin;
use crate::error::EngineError;
use crate::ledger::{
    close_lock_key, pick_entry_product, realized_pnl, resolve_exit_price, CloseOutcome,
    CloseRequest, Ledger, SkipReason,
};
use crate::models::{
    Heartbeat, HeartbeatRole, Order, OrderSide, OrderStatus, Position, ProductType, RiskAlert,
    Segment, TradingAccount,
};

// ─── PgLedger ─────────────────────────────────────────────────────────────────

pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Connect and apply the embedded migration.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to PostgreSQL...");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        // Raw &str goes through the simple query protocol, which accepts the
        // multi-statement migration file in one round trip.
        pool.execute(include_str!("../../migrations/001_init.sql"))
            .await
            .context("Failed to run migration 001_init.sql")?;

        info!("✅ PostgreSQL connected and migrations applied");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ─── Row mapping ──────────────────────────────────────────────────────────────

const POSITION_COLUMNS: &str = "id, account_id, user_id, symbol, instrument_token, segment, \
     quantity, average_price, stop_loss, target, last_price, unrealized_pnl, day_pnl, \
     realized_pnl, lot_size, created_at, updated_at, closed_at";

fn position_from_row(row: &PgRow) -> Result<Position, EngineError> {
    let segment_raw: String = row.try_get("segment")?;
    let segment = Segment::parse(&segment_raw)
        .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("unknown segment {segment_raw}")))?;

    Ok(Position {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        user_id: row.try_get("user_id")?,
        symbol: row.try_get("symbol")?,
        instrument_token: row.try_get("instrument_token")?,
        segment,
        quantity: row.try_get("quantity")?,
        average_price: row.try_get("average_price")?,
        stop_loss: row.try_get("stop_loss")?,
        target: row.try_get("target")?,
        last_price: row.try_get("last_price")?,
        unrealized_pnl: row.try_get("unrealized_pnl")?,
        day_pnl: row.try_get("day_pnl")?,
        realized_pnl: row.try_get("realized_pnl")?,
        lot_size: row.try_get("lot_size")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<Order, EngineError> {
    let side_raw: String = row.try_get("side")?;
    let product_raw: String = row.try_get("product_type")?;
    let status_raw: String = row.try_get("status")?;

    let parse_fail = |what: &str, v: &str| {
        EngineError::Internal(anyhow::anyhow!("unknown {what} {v}"))
    };

    Ok(Order {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        symbol: row.try_get("symbol")?,
        side: OrderSide::parse(&side_raw).ok_or_else(|| parse_fail("side", &side_raw))?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        product_type: ProductType::parse(&product_raw)
            .ok_or_else(|| parse_fail("product_type", &product_raw))?,
        status: OrderStatus::parse(&status_raw)
            .ok_or_else(|| parse_fail("status", &status_raw))?,
        executed_at: row.try_get("executed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<TradingAccount, EngineError> {
    Ok(TradingAccount {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        balance: row.try_get("balance")?,
        available_margin: row.try_get("available_margin")?,
        used_margin: row.try_get("used_margin")?,
    })
}

// ─── Ledger impl ──────────────────────────────────────────────────────────────

#[async_trait]
impl Ledger for PgLedger {
    async fn open_positions(&self, limit: i64) -> Result<Vec<Position>, EngineError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions \
             WHERE quantity != 0 ORDER BY created_at ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(position_from_row).collect()
    }

    async fn position(&self, id: Uuid) -> Result<Option<Position>, EngineError> {
        let sql = format!("SELECT {POSITION_COLUMNS} FROM positions WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(position_from_row).transpose()
    }

    async fn accounts_by_ids(&self, ids: &[Uuid]) -> Result<Vec<TradingAccount>, EngineError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, user_id, balance, available_margin, used_margin \
             FROM trading_accounts WHERE id = ANY($1)",
        )
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn update_position_marks(
        &self,
        id: Uuid,
        unrealized_pnl: f64,
        day_pnl: f64,
        last_price: f64,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE positions \
             SET unrealized_pnl = $2, day_pnl = $3, last_price = $4, updated_at = now() \
             WHERE id = $1 AND quantity != 0",
        )
        .bind(id)
        .bind(unrealized_pnl)
        .bind(day_pnl)
        .bind(last_price)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_position(&self, req: &CloseRequest) -> Result<CloseOutcome, EngineError> {
        let mut tx = self.pool.begin().await?;

        // ── 1. Non-blocking, transaction-scoped lock ──────────────────────────
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(close_lock_key(req.position_id))
            .fetch_one(&mut *tx)
            .await?;
        if !locked {
            // Someone else is closing this position right now. Not an error.
            tx.rollback().await?;
            return Ok(CloseOutcome::skipped(req.position_id, SkipReason::LockNotAcquired));
        }

        // ── 2. Re-read quantity under the lock ────────────────────────────────
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE id = $1 AND account_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(req.position_id)
            .bind(req.account_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(EngineError::NotFound(format!(
                "position {} for account {}",
                req.position_id, req.account_id
            )));
        };
        let position = position_from_row(&row)?;

        if position.quantity == 0 {
            tx.rollback().await?;
            return Ok(CloseOutcome::skipped(req.position_id, SkipReason::AlreadyClosed));
        }

        // ── 3. Exit price ─────────────────────────────────────────────────────
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

        // ── 4. Realized P&L ───────────────────────────────────────────────────
        let pnl = realized_pnl(exit_price, position.average_price, position.quantity);

        // ── 5. Product type used at entry ─────────────────────────────────────
        // Reducing-side orders rank ahead of the rest so a heavily churned
        // symbol cannot push the relevant order outside the fetch window.
        let order_rows = sqlx::query(
            "SELECT id, account_id, symbol, side, quantity, price, product_type, status, \
                    executed_at, created_at \
             FROM orders \
             WHERE account_id = $1 AND symbol = $2 AND status = 'EXECUTED' \
             ORDER BY (side = $3) DESC, executed_at DESC NULLS LAST LIMIT 20",
        )
        .bind(req.account_id)
        .bind(&position.symbol)
        .bind(position.exit_side().as_str())
        .fetch_all(&mut *tx)
        .await?;
        let entry_orders = order_rows
            .iter()
            .map(order_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let product = pick_entry_product(&entry_orders, position.quantity);

        // ── 6. Margin to release: entry average price, absolute quantity ──────
        let margin_released = required_margin(
            position.segment,
            product,
            position.quantity,
            position.average_price,
            position.lot_size,
        )
        .required_margin;

        // ── 7. Offsetting order, executed immediately (no partial fills) ──────
        let exit_order_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO orders \
               (id, account_id, symbol, side, quantity, price, product_type, status, \
                executed_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'EXECUTED', now(), now())",
        )
        .bind(exit_order_id)
        .bind(req.account_id)
        .bind(&position.symbol)
        .bind(position.exit_side().as_str())
        .bind(position.quantity.unsigned_abs() as i64)
        .bind(exit_price)
        .bind(product.as_str())
        .execute(&mut *tx)
        .await?;

        // ── 8. Flatten the position, lock in realized P&L ─────────────────────
        sqlx::query(
            "UPDATE positions \
             SET quantity = 0, realized_pnl = $2, unrealized_pnl = 0, \
                 last_price = $3, closed_at = now(), updated_at = now() \
             WHERE id = $1",
        )
        .bind(position.id)
        .bind(pnl)
        .bind(exit_price)
        .execute(&mut *tx)
        .await?;

        // ── 9 + 10. Release margin, settle P&L against the balance ────────────
        sqlx::query(
            "UPDATE trading_accounts \
             SET available_margin = available_margin + $2, \
                 used_margin = GREATEST(used_margin - $2, 0), \
                 balance = balance + $3 \
             WHERE id = $1",
        )
        .bind(req.account_id)
        .bind(margin_released)
        .bind(pnl)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            position_id = %position.id,
            symbol      = %position.symbol,
            trigger     = req.trigger.as_str(),
            exit_price,
            realized_pnl = pnl,
            margin_released,
            "💰 Position settled and closed"
        );

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
        // Single statement keeps check + insert race-free enough for a
        // throttle: a duplicate slipping through a concurrent backstop run
        // is tolerable, a storm is not.
        let result = sqlx::query(
            "INSERT INTO risk_alerts (id, account_id, level, loss_utilization, message, created_at) \
             SELECT $1, $2, $3, $4, $5, $6 \
             WHERE NOT EXISTS ( \
               SELECT 1 FROM risk_alerts \
               WHERE account_id = $2 \
                 AND created_at > $6 - make_interval(secs => $7::double precision))",
        )
        .bind(alert.id)
        .bind(alert.account_id)
        .bind(alert.level.as_str())
        .bind(alert.loss_utilization)
        .bind(&alert.message)
        .bind(alert.created_at)
        .bind(cooldown_secs as f64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn write_heartbeat(
        &self,
        role: HeartbeatRole,
        heartbeat: &Heartbeat,
    ) -> Result<(), EngineError> {
        let payload = serde_json::to_string(heartbeat)
            .map_err(|e| EngineError::Internal(anyhow::Error::from(e)))?;

        sqlx::query(
            "INSERT INTO engine_heartbeats (role, payload, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (role) DO UPDATE SET payload = EXCLUDED.payload, updated_at = now()",
        )
        .bind(role.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_heartbeat(
        &self,
        role: HeartbeatRole,
    ) -> Result<Option<Heartbeat>, EngineError> {
        let row = sqlx::query("SELECT payload FROM engine_heartbeats WHERE role = $1")
            .bind(role.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let payload: String = row.try_get("payload")?;
        let heartbeat = serde_json::from_str(&payload)
            .map_err(|e| EngineError::Internal(anyhow::Error::from(e)))?;
        Ok(Some(heartbeat))
    }
}
