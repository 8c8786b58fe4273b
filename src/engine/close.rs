//! # engine::close — the settle-and-close entry point
//!
//! Thin orchestration over [`Ledger::close_position`]: resolves an exit
//! price up front (the only network hop, outside the transaction), runs the
//! atomic close, emits the `POSITION_CLOSED` event. Every caller — tick
//! worker, backstop, user action — funnels through here, so the advisory
//! lock in the ledger is the single point of mutual exclusion.

use std::sync::atomic::Ordering;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::PushEvent;
use crate::ledger::{CloseOutcome, CloseRequest, CloseTrigger};
use crate::state::SharedState;

/// Close one position.
///
/// `exit_price_override` short-circuits the quote fetch — the tick worker
/// always passes the price it just computed. Callers must treat
/// `outcome.skipped == true` as success: another actor won the race or the
/// position was already flat.
pub async fn close_position(
    state: &SharedState,
    position_id: Uuid,
    account_id: Uuid,
    exit_price_override: Option<f64>,
    trigger: CloseTrigger,
) -> Result<CloseOutcome, EngineError> {
    // ── 1. Resolve an exit price before opening the transaction ──────────────
    let exit_price_override = match exit_price_override.filter(|p| *p > 0.0) {
        Some(price) => Some(price),
        None => {
            let position = state
                .ledger
                .position(position_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("position {position_id}")))?;

            state
                .quotes
                .get_quote(position.instrument_token)
                .await
                .filter(|q| !q.is_stale(state.config.quote_stale_secs))
                .map(|q| q.last_trade_price)
                .filter(|p| *p > 0.0)
            // None here is fine — the ledger still has the stored last
            // price and average entry price to fall back on.
        }
    };

    // ── 2. Atomic close ───────────────────────────────────────────────────────
    let request = CloseRequest {
        position_id,
        account_id,
        exit_price_override,
        trigger,
    };
    let outcome = state.ledger.close_position(&request).await?;

    // ── 3. Fan out ────────────────────────────────────────────────────────────
    if outcome.skipped {
        debug!(
            position_id = %position_id,
            reason = ?outcome.reason,
            "Close skipped — another actor settled first"
        );
        return Ok(outcome);
    }

    state.close_count.fetch_add(1, Ordering::Relaxed);

    if let (Some(user_id), Some(symbol)) = (outcome.user_id, outcome.symbol.clone()) {
        state.broadcast(&PushEvent::PositionClosed {
            user_id,
            position_id,
            symbol,
            exit_price: outcome.exit_price,
            realized_pnl: outcome.realized_pnl,
            trigger: trigger.as_str().to_string(),
        });
    }

    info!(
        position_id  = %position_id,
        trigger      = trigger.as_str(),
        exit_price   = outcome.exit_price,
        realized_pnl = outcome.realized_pnl,
        "✅ Close settled"
    );

    Ok(outcome)
}
