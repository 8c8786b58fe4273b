//! # models::heartbeat
//!
//! A single most-recent-wins record describing the last completed tick.
//! Overwritten unconditionally at the end of every run — even a failed one —
//! so operational tooling can distinguish "ran with errors" from "did not
//! run". The Backstop Runner keeps its own slot and may embed the nested
//! tick report it produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Role ─────────────────────────────────────────────────────────────────────

/// Which actor wrote the record. One slot per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartbeatRole {
    Worker,
    Backstop,
}

impl HeartbeatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatRole::Worker => "WORKER",
            HeartbeatRole::Backstop => "BACKSTOP",
        }
    }
}

// ─── Heartbeat ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub last_run_at: DateTime<Utc>,
    pub host:        String,
    pub pid:         u32,

    // ── Tick counters ─────────────────────────────────────────────────────────
    pub scanned:    u64,
    pub updated:    u64,
    pub skipped:    u64,
    pub errors:     u64,
    pub elapsed_ms: u64,

    /// "active" | "disabled" | "dry_run" | "failed" | "backstop" |
    /// "backstop_skipped"
    pub mode: String,

    // ── Close / alert counters ────────────────────────────────────────────────
    pub stop_loss_auto_closed: u64,
    pub target_auto_closed:    u64,
    pub risk_auto_closed:      u64,
    pub risk_alerts_created:   u64,

    // ── Thresholds in effect for this run ─────────────────────────────────────
    pub risk_warning_threshold:    f64,
    pub risk_auto_close_threshold: f64,

    /// Backstop only: the report of the tick it forced, if it forced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<serde_json::Value>,
}

impl Heartbeat {
    /// Age of the record relative to `now`, in seconds (negative clock skew
    /// clamps to zero).
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_run_at).num_seconds().max(0)
    }

    /// A run is healthy when errors stayed a minority of the scanned rows.
    /// An empty scan with zero errors is healthy; any error on an empty scan
    /// (e.g. the load itself failed) is not.
    pub fn error_rate_acceptable(&self, max_ratio: f64) -> bool {
        if self.scanned == 0 {
            return self.errors == 0;
        }
        (self.errors as f64) / (self.scanned as f64) <= max_ratio
    }
}
