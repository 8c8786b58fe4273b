//! # config — Engine configuration snapshot
//!
//! All knobs load from env once at startup into an immutable
//! [`EngineConfig`] carried in `AppState`. Per-tick parameters
//! ([`crate::engine::tick::TickParams`]) are derived fresh from this
//! snapshot every run — thresholds are never cached across ticks.

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    // ── Tick loop ─────────────────────────────────────────────────────────────
    /// Seconds between in-process tick runs (0 = no in-process loop).
    pub tick_interval_secs: u64,
    /// Max open positions loaded per tick.
    pub tick_batch_limit: i64,
    /// Durable-store write suppression: skip the row update when both
    /// |Δunrealized| and |Δday| stay below this (currency units).
    pub update_threshold: f64,

    // ── Risk thresholds ───────────────────────────────────────────────────────
    /// Loss utilization that raises a WARNING alert.
    pub risk_warning_threshold: f64,
    /// Loss utilization that force-closes positions.
    pub risk_auto_close_threshold: f64,

    // ── Backpressure caps ─────────────────────────────────────────────────────
    /// Max stop-loss/target closes executed in one tick.
    pub max_trigger_closes_per_tick: usize,
    /// Max risk-driven closes per account per tick.
    pub max_risk_closes_per_account: usize,
    /// Seconds between risk alerts for the same account.
    pub alert_cooldown_secs: i64,

    // ── Heartbeat / backstop ──────────────────────────────────────────────────
    /// Worker heartbeat older than this is considered stale by the backstop.
    pub heartbeat_stale_secs: i64,
    /// Max errors/scanned ratio the backstop still considers healthy.
    pub heartbeat_error_ratio: f64,

    // ── Fan-out ───────────────────────────────────────────────────────────────
    /// Max P&L updates per pushed event.
    pub event_chunk_size: usize,
    /// TTL of cached P&L snapshots, seconds.
    pub cache_ttl_secs: u64,

    // ── Quote feed ────────────────────────────────────────────────────────────
    /// Hard timeout on one quote fetch, milliseconds.
    pub quote_timeout_ms: u64,
    /// Live quotes older than this are treated as absent, seconds.
    pub quote_stale_secs: i64,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            tick_interval_secs:           env_u64("TICK_INTERVAL_SECS", 3),
            tick_batch_limit:             env_i64("TICK_BATCH_LIMIT", 500),
            update_threshold:             env_f64("PNL_UPDATE_THRESHOLD", 1.0),
            risk_warning_threshold:       env_f64("RISK_WARNING_THRESHOLD", 0.80),
            risk_auto_close_threshold:    env_f64("RISK_AUTO_CLOSE_THRESHOLD", 0.90),
            max_trigger_closes_per_tick:  env_usize("MAX_TRIGGER_CLOSES_PER_TICK", 20),
            max_risk_closes_per_account:  env_usize("MAX_RISK_CLOSES_PER_ACCOUNT", 5),
            alert_cooldown_secs:          env_i64("RISK_ALERT_COOLDOWN_SECS", 600),
            heartbeat_stale_secs:         env_i64("HEARTBEAT_STALE_SECS", 120),
            heartbeat_error_ratio:        env_f64("HEARTBEAT_ERROR_RATIO", 0.5),
            event_chunk_size:             env_usize("EVENT_CHUNK_SIZE", 50),
            cache_ttl_secs:               env_u64("PNL_CACHE_TTL_SECS", 30),
            quote_timeout_ms:             env_u64("QUOTE_TIMEOUT_MS", 1500),
            quote_stale_secs:             env_i64("QUOTE_STALE_SECS", 60),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        // Defaults only — ignores the environment. Used by tests.
        Self {
            tick_interval_secs: 3,
            tick_batch_limit: 500,
            update_threshold: 1.0,
            risk_warning_threshold: 0.80,
            risk_auto_close_threshold: 0.90,
            max_trigger_closes_per_tick: 20,
            max_risk_closes_per_account: 5,
            alert_cooldown_secs: 600,
            heartbeat_stale_secs: 120,
            heartbeat_error_ratio: 0.5,
            event_chunk_size: 50,
            cache_ttl_secs: 30,
            quote_timeout_ms: 1500,
            quote_stale_secs: 60,
        }
    }
}

// ─── Env helpers ──────────────────────────────────────────────────────────────

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
