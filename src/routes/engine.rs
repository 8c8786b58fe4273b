//! # routes::engine
//!
//! The engine invocation surface. `POST /api/engine/tick` is the single
//! callable entry point behind the in-process loop, any external scheduler
//! and the operator "run now" button — all three funnel into the same
//! `process_tick`.
//!
//! | Method | Path                    | Description                          |
//! |--------|-------------------------|--------------------------------------|
//! | POST   | `/api/engine/tick`      | Run one tick (supports dry_run)      |
//! | POST   | `/api/engine/backstop`  | Backstop check, optional force       |
//! | GET    | `/api/engine/heartbeat` | Worker + backstop heartbeats         |
//! | POST   | `/api/engine/pause`     | Soft-disable the worker              |
//! | POST   | `/api/engine/resume`    | Re-enable the worker                 |
//! | GET    | `/api/engine/status`    | Mode flag and counters               |

use std::sync::atomic::Ordering;

use axum::{extract::State, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::engine::backstop::run_backstop;
use crate::engine::tick::{process_tick, TickParams};
use crate::error::EngineError;
use crate::models::HeartbeatRole;
use crate::state::SharedState;

// ─── POST /api/engine/tick ────────────────────────────────────────────────────

/// Every field optional — omitted knobs fall back to the config snapshot.
#[derive(Debug, Default, Deserialize)]
pub struct TickRequest {
    pub limit:            Option<i64>,
    pub update_threshold: Option<f64>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force_run: bool,
    pub max_trigger_closes:          Option<usize>,
    pub max_risk_closes_per_account: Option<usize>,
    pub alert_cooldown_secs:         Option<i64>,
}

pub async fn run_tick(
    State(state): State<SharedState>,
    body: Option<Json<TickRequest>>,
) -> Result<impl IntoResponse, EngineError> {
    let Json(req) = body.unwrap_or_default();

    let mut params = TickParams::from_config(&state.config);
    params.dry_run = req.dry_run;
    params.force_run = req.force_run;
    if let Some(limit) = req.limit {
        if limit <= 0 {
            return Err(EngineError::BadRequest("limit must be positive".into()));
        }
        params.limit = limit;
    }
    if let Some(threshold) = req.update_threshold {
        if threshold < 0.0 {
            return Err(EngineError::BadRequest("update_threshold must be >= 0".into()));
        }
        params.update_threshold = threshold;
    }
    if let Some(cap) = req.max_trigger_closes {
        params.max_trigger_closes = cap;
    }
    if let Some(cap) = req.max_risk_closes_per_account {
        params.max_risk_closes_per_account = cap;
    }
    if let Some(cooldown) = req.alert_cooldown_secs {
        params.alert_cooldown_secs = cooldown;
    }

    let report = process_tick(&state, &params).await;
    Ok(Json(json!({ "ok": true, "report": report })))
}

// ─── POST /api/engine/backstop ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct BackstopRequest {
    #[serde(default)]
    pub force: bool,
}

pub async fn run_backstop_check(
    State(state): State<SharedState>,
    body: Option<Json<BackstopRequest>>,
) -> impl IntoResponse {
    let Json(req) = body.unwrap_or_default();
    let report = run_backstop(&state, req.force).await;
    Json(json!({ "ok": true, "backstop": report }))
}

// ─── GET /api/engine/heartbeat ────────────────────────────────────────────────

pub async fn get_heartbeats(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, EngineError> {
    let worker = state.ledger.read_heartbeat(HeartbeatRole::Worker).await?;
    let backstop = state.ledger.read_heartbeat(HeartbeatRole::Backstop).await?;

    Ok(Json(json!({
        "ok":       true,
        "worker":   worker,
        "backstop": backstop,
    })))
}

// ─── Mode control ─────────────────────────────────────────────────────────────

pub async fn pause_engine(State(state): State<SharedState>) -> impl IntoResponse {
    state.set_enabled(false);
    info!("⏸️ Engine paused by operator");
    Json(json!({ "ok": true, "enabled": false }))
}

pub async fn resume_engine(State(state): State<SharedState>) -> impl IntoResponse {
    state.set_enabled(true);
    info!("▶️ Engine resumed by operator");
    Json(json!({ "ok": true, "enabled": true }))
}

pub async fn get_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "ok":          true,
        "enabled":     state.is_enabled(),
        "tick_count":  state.tick_count.load(Ordering::Relaxed),
        "close_count": state.close_count.load(Ordering::Relaxed),
    }))
}
