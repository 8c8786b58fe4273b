//! # routes::positions
//!
//! The positions API: reading the open book and the user-initiated close.
//!
//! A close that comes back `skipped = true` is surfaced as **success** with
//! an explanatory reason — the position is (or is being) closed either way;
//! only a genuinely failed settlement (e.g. no resolvable exit price)
//! becomes an error response.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::engine::close;
use crate::error::EngineError;
use crate::ledger::CloseTrigger;
use crate::state::SharedState;

// ─── GET /api/positions ───────────────────────────────────────────────────────

pub async fn list_open_positions(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, EngineError> {
    let positions = state
        .ledger
        .open_positions(state.config.tick_batch_limit)
        .await?;

    Ok(Json(json!({
        "ok":        true,
        "count":     positions.len(),
        "positions": positions,
    })))
}

// ─── GET /api/positions/:id/pnl ───────────────────────────────────────────────

/// The low-latency read path: cached snapshot if present, else the stored
/// row's last marks.
pub async fn get_position_pnl(
    State(state): State<SharedState>,
    Path(position_id): Path<Uuid>,
) -> Result<impl IntoResponse, EngineError> {
    if let Some(snapshot) = state.cache.get(position_id).await {
        return Ok(Json(json!({ "ok": true, "source": "cache", "pnl": snapshot })));
    }

    let position = state
        .ledger
        .position(position_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("position {position_id}")))?;

    Ok(Json(json!({
        "ok":     true,
        "source": "store",
        "pnl": {
            "position_id":    position.id,
            "unrealized_pnl": position.unrealized_pnl,
            "day_pnl":        position.day_pnl,
            "current_price":  position.last_price,
            "updated_at_ms":  position.updated_at.timestamp_millis(),
        },
    })))
}

// ─── POST /api/positions/:id/close ────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CloseBody {
    /// Optional exit price override; ignored unless positive.
    pub exit_price: Option<f64>,
}

pub async fn close_position(
    State(state): State<SharedState>,
    Path(position_id): Path<Uuid>,
    body: Option<Json<CloseBody>>,
) -> Result<impl IntoResponse, EngineError> {
    let Json(body) = body.unwrap_or_default();

    let position = state
        .ledger
        .position(position_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("position {position_id}")))?;

    let outcome = close::close_position(
        &state,
        position_id,
        position.account_id,
        body.exit_price,
        CloseTrigger::Manual,
    )
    .await?;

    // skipped = true is a success-shaped no-op, never an error toast.
    Ok(Json(json!({
        "ok":              true,
        "skipped":         outcome.skipped,
        "reason":          outcome.reason.map(|r| r.as_str()),
        "exit_order_id":   outcome.exit_order_id,
        "exit_price":      outcome.exit_price,
        "realized_pnl":    outcome.realized_pnl,
        "margin_released": outcome.margin_released,
    })))
}
