//! # engine::tick — P&L Tick Worker
//!
//! One tick = one scan-evaluate-act pass over the open book:
//!
//! ```text
//! 1. Mode gate (soft-disable, unless forced)
//! 2. Load open positions (bounded batch)
//! 3. Ensure the quote feed streams their tokens
//! 4. Scan (read-only): normalize quote → P&L → cache write (always) →
//!    per-account exposure → per-user event batch → queue exit triggers →
//!    durable write only past the update threshold
//! 5. Execute queued stop-loss/target closes (capped per tick)
//! 6. Risk evaluation per account → capped auto-closes + throttled alerts
//! 7. Batch-emit P&L events per user (chunked)
//! 8. Write the heartbeat — even after a fatal load error
//! ```
//!
//! Per-position failures are counted and the loop continues; nothing in
//! here ever escapes to crash the process. `dry_run` computes and returns
//! every count while writing nothing (store, cache, closes, heartbeat).

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::PnlSnapshot;
use crate::config::EngineConfig;
use crate::engine::close;
use crate::engine::pricing::{day_pnl, resolve_prices, unrealized_pnl};
use crate::engine::risk::{evaluate_account, ExposureLine, RiskStatus, RiskThresholds};
use crate::engine::triggers::{check_exit_triggers, ExitTrigger};
use crate::events::{chunk_updates, PnlUpdate, PushEvent};
use crate::ledger::CloseTrigger;
use crate::models::{AlertLevel, Heartbeat, HeartbeatRole, RiskAlert};
use crate::state::SharedState;

// ─── Parameters ───────────────────────────────────────────────────────────────

/// One tick's knobs, derived fresh from the config snapshot per run so
/// threshold changes take effect on the next tick, never mid-tick.
#[derive(Debug, Clone, Deserialize)]
pub struct TickParams {
    pub limit:            i64,
    pub update_threshold: f64,
    /// Compute everything, write nothing.
    pub dry_run: bool,
    /// Run even when the engine is soft-disabled (backstop / operator).
    pub force_run: bool,
    pub max_trigger_closes:          usize,
    pub max_risk_closes_per_account: usize,
    pub alert_cooldown_secs:         i64,
}

impl TickParams {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            limit: cfg.tick_batch_limit,
            update_threshold: cfg.update_threshold,
            dry_run: false,
            force_run: false,
            max_trigger_closes: cfg.max_trigger_closes_per_tick,
            max_risk_closes_per_account: cfg.max_risk_closes_per_account,
            alert_cooldown_secs: cfg.alert_cooldown_secs,
        }
    }

    /// Backstop profile: forced, doubled close caps, no alert cooldown.
    pub fn aggressive(cfg: &EngineConfig) -> Self {
        Self {
            force_run: true,
            max_trigger_closes: cfg.max_trigger_closes_per_tick * 2,
            max_risk_closes_per_account: cfg.max_risk_closes_per_account * 2,
            alert_cooldown_secs: 0,
            ..Self::from_config(cfg)
        }
    }
}

// ─── Report ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    pub scanned: u64,
    pub updated: u64,
    /// Rows whose durable write was suppressed by the update threshold.
    pub skipped: u64,
    pub errors:  u64,

    pub cache_writes:   u64,
    pub events_emitted: u64,

    pub stop_loss_auto_closed: u64,
    pub target_auto_closed:    u64,
    pub risk_auto_closed:      u64,
    pub risk_alerts_created:   u64,

    pub elapsed_ms: u64,
    /// "active" | "forced" | "dry_run" | "disabled" | "failed"
    pub mode:    String,
    pub dry_run: bool,
}

// ─── Scan accumulator ─────────────────────────────────────────────────────────

struct AccountScan {
    user_id: Uuid,
    lines:   Vec<ExposureLine>,
}

/// A stop-loss/target breach queued during the read-only scan phase.
struct QueuedClose {
    position_id:   Uuid,
    account_id:    Uuid,
    trigger:       ExitTrigger,
    current_price: f64,
}

// ─── Tick ─────────────────────────────────────────────────────────────────────

/// Run one tick. Never returns an error: failures are reflected in the
/// report and heartbeat, and the next scheduled tick retries naturally.
pub async fn process_tick(state: &SharedState, params: &TickParams) -> TickReport {
    let started = Instant::now();
    let cfg = state.config.clone();
    state.tick_count.fetch_add(1, Ordering::Relaxed);

    let mut report = TickReport {
        dry_run: params.dry_run,
        mode: if params.dry_run {
            "dry_run".to_string()
        } else if params.force_run && !state.is_enabled() {
            "forced".to_string()
        } else {
            "active".to_string()
        },
        ..TickReport::default()
    };

    // ── 1. Mode gate ──────────────────────────────────────────────────────────
    if !state.is_enabled() && !params.force_run {
        report.mode = "disabled".to_string();
        info!("⏸️ Engine soft-disabled — tick skipped");
        finish_tick(state, params, &mut report, started).await;
        return report;
    }

    // ── 2. Load the open book ─────────────────────────────────────────────────
    let positions = match state.ledger.open_positions(params.limit).await {
        Ok(positions) => positions,
        Err(e) => {
            // Fatal for this tick only. Heartbeat still records the attempt.
            error!(error = %e, "Tick aborted: cannot load open positions");
            report.errors += 1;
            report.mode = "failed".to_string();
            finish_tick(state, params, &mut report, started).await;
            return report;
        }
    };
    report.scanned = positions.len() as u64;

    // ── 3. Keep the feed subscribed ───────────────────────────────────────────
    let mut tokens: Vec<i64> = positions.iter().map(|p| p.instrument_token).collect();
    tokens.sort_unstable();
    tokens.dedup();
    state.quotes.ensure_subscribed(&tokens).await;

    // ── 4. Scan (read-only; closes are queued, not executed inline) ──────────
    let mut account_scans: HashMap<Uuid, AccountScan> = HashMap::new();
    let mut user_updates: HashMap<Uuid, Vec<PnlUpdate>> = HashMap::new();
    let mut current_prices: HashMap<Uuid, f64> = HashMap::new();
    let mut close_queue: Vec<QueuedClose> = Vec::new();
    let cache_ttl = Duration::from_secs(cfg.cache_ttl_secs);

    for position in &positions {
        let live = state
            .quotes
            .get_quote(position.instrument_token)
            .await
            .filter(|q| !q.is_stale(cfg.quote_stale_secs));

        let resolved = resolve_prices(live.as_ref(), position.last_price, position.average_price);
        if resolved.current <= 0.0 {
            // No price from any source; marking would be meaningless.
            debug!(position_id = %position.id, "No resolvable price — row skipped");
            report.errors += 1;
            continue;
        }

        let unrealized = unrealized_pnl(resolved.current, position.average_price, position.quantity);
        let day = day_pnl(resolved.current, resolved.prev_close, position.quantity);

        // Cache write happens always — even when the durable write below is
        // suppressed — so the fast read path never lags the computation.
        let snapshot = PnlSnapshot {
            position_id: position.id,
            unrealized_pnl: unrealized,
            day_pnl: day,
            current_price: resolved.current,
            updated_at_ms: Utc::now().timestamp_millis(),
        };
        if !params.dry_run {
            state.cache.set(snapshot, cache_ttl).await;
        }
        report.cache_writes += 1;

        current_prices.insert(position.id, resolved.current);

        account_scans
            .entry(position.account_id)
            .or_insert_with(|| AccountScan {
                user_id: position.user_id,
                lines: Vec::new(),
            })
            .lines
            .push(ExposureLine {
                position_id: position.id,
                symbol: position.symbol.clone(),
                quantity: position.quantity,
                unrealized_pnl: unrealized,
            });

        user_updates
            .entry(position.user_id)
            .or_default()
            .push(PnlUpdate {
                position_id: position.id,
                unrealized_pnl: unrealized,
                day_pnl: day,
                current_price: resolved.current,
                updated_at_ms: snapshot.updated_at_ms,
            });

        if let Some(trigger) =
            check_exit_triggers(position.quantity, position.stop_loss, position.target, resolved.current)
        {
            close_queue.push(QueuedClose {
                position_id: position.id,
                account_id: position.account_id,
                trigger,
                current_price: resolved.current,
            });
        }

        // Durable write only past the threshold, to bound write amplification.
        let delta_unrealized = (unrealized - position.unrealized_pnl).abs();
        let delta_day = (day - position.day_pnl).abs();
        if delta_unrealized >= params.update_threshold || delta_day >= params.update_threshold {
            if params.dry_run {
                report.updated += 1;
            } else {
                match state
                    .ledger
                    .update_position_marks(position.id, unrealized, day, resolved.current)
                    .await
                {
                    Ok(()) => report.updated += 1,
                    Err(e) => {
                        warn!(position_id = %position.id, error = %e, "Mark write failed — continuing");
                        report.errors += 1;
                    }
                }
            }
        } else {
            report.skipped += 1;
        }
    }

    // ── 5. Stop-loss / target closes, capped per tick ─────────────────────────
    for queued in close_queue.iter().take(params.max_trigger_closes) {
        if params.dry_run {
            // Counted, not executed.
            match queued.trigger {
                ExitTrigger::StopLoss => report.stop_loss_auto_closed += 1,
                ExitTrigger::Target => report.target_auto_closed += 1,
            }
            continue;
        }

        let close_trigger = match queued.trigger {
            ExitTrigger::StopLoss => CloseTrigger::StopLoss,
            ExitTrigger::Target => CloseTrigger::Target,
        };
        match close::close_position(
            state,
            queued.position_id,
            queued.account_id,
            Some(queued.current_price),
            close_trigger,
        )
        .await
        {
            Ok(outcome) if !outcome.skipped => match queued.trigger {
                ExitTrigger::StopLoss => report.stop_loss_auto_closed += 1,
                ExitTrigger::Target => report.target_auto_closed += 1,
            },
            Ok(_) => {} // lost the race to another actor — fine
            Err(e) => {
                warn!(position_id = %queued.position_id, error = %e, "Trigger close failed");
                report.errors += 1;
            }
        }
    }
    if close_queue.len() > params.max_trigger_closes {
        warn!(
            queued = close_queue.len(),
            cap = params.max_trigger_closes,
            "Trigger close cap reached — remainder deferred to the next tick"
        );
    }

    // ── 6. Risk evaluation per account ────────────────────────────────────────
    run_risk_phase(state, params, &cfg, &account_scans, &current_prices, &mut report).await;

    // ── 7. Fan out P&L updates per user, chunked ──────────────────────────────
    if !params.dry_run {
        for (user_id, updates) in user_updates {
            for chunk in chunk_updates(updates, cfg.event_chunk_size) {
                state.broadcast(&PushEvent::PositionsPnlUpdated {
                    user_id,
                    updates: chunk,
                });
                report.events_emitted += 1;
            }
        }
    }

    // ── 8. Heartbeat, unconditionally ─────────────────────────────────────────
    finish_tick(state, params, &mut report, started).await;
    report
}

// ─── Risk phase ───────────────────────────────────────────────────────────────

async fn run_risk_phase(
    state: &SharedState,
    params: &TickParams,
    cfg: &EngineConfig,
    account_scans: &HashMap<Uuid, AccountScan>,
    current_prices: &HashMap<Uuid, f64>,
    report: &mut TickReport,
) {
    let account_ids: Vec<Uuid> = account_scans.keys().copied().collect();
    if account_ids.is_empty() {
        return;
    }

    let mut accounts = match state.ledger.accounts_by_ids(&account_ids).await {
        Ok(accounts) => accounts,
        Err(e) => {
            error!(error = %e, "Risk phase skipped: cannot load accounts");
            report.errors += 1;
            return;
        }
    };
    // Deterministic account order keeps runs comparable.
    accounts.sort_by_key(|a| a.id);

    let thresholds = RiskThresholds {
        warning: cfg.risk_warning_threshold,
        auto_close: cfg.risk_auto_close_threshold,
    };

    for account in &accounts {
        let Some(scan) = account_scans.get(&account.id) else { continue };

        let assessment = evaluate_account(
            &scan.lines,
            account.total_funds(),
            thresholds,
            params.max_risk_closes_per_account,
        );

        if assessment.status == RiskStatus::Safe {
            continue;
        }

        let level = match assessment.status {
            RiskStatus::Warning => AlertLevel::Warning,
            RiskStatus::Critical => AlertLevel::Critical,
            RiskStatus::Safe => unreachable!(),
        };
        let message = format!(
            "Loss utilization at {:.1}% of total funds (unrealized {:.2})",
            assessment.loss_utilization * 100.0,
            assessment.total_unrealized,
        );

        warn!(
            account_id = %account.id,
            status = assessment.status.as_str(),
            loss_utilization = assessment.loss_utilization,
            "🛑 Risk threshold breached"
        );

        if !params.dry_run {
            let alert = RiskAlert::new(account.id, level, assessment.loss_utilization, message.clone());
            match state
                .ledger
                .try_insert_risk_alert(&alert, params.alert_cooldown_secs)
                .await
            {
                Ok(true) => {
                    report.risk_alerts_created += 1;
                    state.broadcast(&PushEvent::RiskAlert {
                        user_id: account.user_id,
                        account_id: account.id,
                        level,
                        loss_utilization: assessment.loss_utilization,
                        message,
                    });
                }
                Ok(false) => debug!(account_id = %account.id, "Risk alert throttled by cooldown"),
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "Risk alert write failed");
                    report.errors += 1;
                }
            }
        }

        if assessment.status != RiskStatus::Critical {
            continue;
        }

        // Forced exits, worst loss first, capped per account.
        for position_id in &assessment.candidates {
            if params.dry_run {
                report.risk_auto_closed += 1;
                continue;
            }
            let exit_override = current_prices.get(position_id).copied();
            match close::close_position(
                state,
                *position_id,
                account.id,
                exit_override,
                CloseTrigger::RiskAutoClose,
            )
            .await
            {
                Ok(outcome) if !outcome.skipped => report.risk_auto_closed += 1,
                Ok(_) => {} // already flattened by the trigger phase or a rival
                Err(e) => {
                    warn!(position_id = %position_id, error = %e, "Risk auto-close failed");
                    report.errors += 1;
                }
            }
        }
    }
}

// ─── Heartbeat ────────────────────────────────────────────────────────────────

pub fn heartbeat_from_report(report: &TickReport, cfg: &EngineConfig) -> Heartbeat {
    Heartbeat {
        last_run_at: Utc::now(),
        host: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        pid: std::process::id(),
        scanned: report.scanned,
        updated: report.updated,
        skipped: report.skipped,
        errors: report.errors,
        elapsed_ms: report.elapsed_ms,
        mode: report.mode.clone(),
        stop_loss_auto_closed: report.stop_loss_auto_closed,
        target_auto_closed: report.target_auto_closed,
        risk_auto_closed: report.risk_auto_closed,
        risk_alerts_created: report.risk_alerts_created,
        risk_warning_threshold: cfg.risk_warning_threshold,
        risk_auto_close_threshold: cfg.risk_auto_close_threshold,
        nested: None,
    }
}

/// Close out the report and persist the worker heartbeat. A dry run writes
/// nothing, including the heartbeat — it must never mask the real worker's
/// record from the backstop.
async fn finish_tick(
    state: &SharedState,
    params: &TickParams,
    report: &mut TickReport,
    started: Instant,
) {
    report.elapsed_ms = started.elapsed().as_millis() as u64;

    if !params.dry_run {
        state.broadcast(&PushEvent::EngineStats {
            scanned: report.scanned,
            updated: report.updated,
            errors: report.errors,
            elapsed_ms: report.elapsed_ms,
            mode: report.mode.clone(),
        });

        let heartbeat = heartbeat_from_report(report, &state.config);
        if let Err(e) = state
            .ledger
            .write_heartbeat(HeartbeatRole::Worker, &heartbeat)
            .await
        {
            error!(error = %e, "Heartbeat write failed");
        }
    }

    info!(
        scanned = report.scanned,
        updated = report.updated,
        skipped = report.skipped,
        errors  = report.errors,
        closes  = report.stop_loss_auto_closed + report.target_auto_closed + report.risk_auto_closed,
        elapsed_ms = report.elapsed_ms,
        mode = %report.mode,
        "Tick complete"
    );
}
