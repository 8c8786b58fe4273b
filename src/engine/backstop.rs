//! # engine::backstop — Backstop Runner
//!
//! Safety net for deployments where the in-process tick loop may not be
//! running continuously (serverless cron, operator "run now"). Reads the
//! worker's heartbeat; if it is fresh and the error rate acceptable, does
//! nothing beyond recording its own skip. Otherwise runs one synchronous
//! tick in the aggressive profile (doubled close caps, zero alert cooldown)
//! and republishes its heartbeat with the nested tick report embedded.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::tick::{heartbeat_from_report, process_tick, TickParams, TickReport};
use crate::models::{Heartbeat, HeartbeatRole};
use crate::state::SharedState;

#[derive(Debug, Clone, Serialize)]
pub struct BackstopReport {
    /// False = worker looked healthy, nothing was run.
    pub ran: bool,
    pub worker_heartbeat_age_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick: Option<TickReport>,
}

/// Check the worker, force a tick if it looks dead or if `force` is set.
pub async fn run_backstop(state: &SharedState, force: bool) -> BackstopReport {
    let cfg = state.config.clone();
    let now = Utc::now();

    // ── 1. Judge the worker by its last heartbeat ─────────────────────────────
    let worker_heartbeat = match state.ledger.read_heartbeat(HeartbeatRole::Worker).await {
        Ok(hb) => hb,
        Err(e) => {
            warn!(error = %e, "Backstop could not read worker heartbeat — assuming stale");
            None
        }
    };

    let age_secs = worker_heartbeat.as_ref().map(|hb| hb.age_secs(now));
    let healthy = worker_heartbeat
        .as_ref()
        .map(|hb| {
            hb.age_secs(now) <= cfg.heartbeat_stale_secs
                && hb.error_rate_acceptable(cfg.heartbeat_error_ratio)
        })
        .unwrap_or(false);

    // ── 2. Healthy and not forced: record the skip, stand down ───────────────
    if healthy && !force {
        info!(age_secs = ?age_secs, "Backstop: worker healthy — skipping");
        let skip_heartbeat = Heartbeat {
            mode: "backstop_skipped".to_string(),
            ..heartbeat_from_report(&TickReport::default(), &cfg)
        };
        if let Err(e) = state
            .ledger
            .write_heartbeat(HeartbeatRole::Backstop, &skip_heartbeat)
            .await
        {
            warn!(error = %e, "Backstop heartbeat write failed");
        }
        return BackstopReport {
            ran: false,
            worker_heartbeat_age_secs: age_secs,
            tick: None,
        };
    }

    // ── 3. Stale, unhealthy or forced: run one aggressive tick ───────────────
    warn!(
        age_secs = ?age_secs,
        forced = force,
        "🚨 Backstop engaging — running a forced tick"
    );
    let params = TickParams::aggressive(&cfg);
    let report = process_tick(state, &params).await;

    let mut backstop_heartbeat = heartbeat_from_report(&report, &cfg);
    backstop_heartbeat.mode = "backstop".to_string();
    backstop_heartbeat.nested = serde_json::to_value(&report).ok();
    if let Err(e) = state
        .ledger
        .write_heartbeat(HeartbeatRole::Backstop, &backstop_heartbeat)
        .await
    {
        warn!(error = %e, "Backstop heartbeat write failed");
    }

    BackstopReport {
        ran: true,
        worker_heartbeat_age_secs: age_secs,
        tick: Some(report),
    }
}
