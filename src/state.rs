//! # state
//!
//! AppState shared by every axum handler and the in-process tick loop —
//! ledger, quote source, cache, broadcast channel and the engine mode flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cache::PnlCache;
use crate::config::EngineConfig;
use crate::events::PushEvent;
use crate::ledger::Ledger;
use crate::quotes::QuoteSource;

/// A pre-serialized event frame: `(scope, JSON)`. `scope = Some(user)`
/// reaches that user's sockets only, `None` reaches everyone.
pub type PushFrame = (Option<Uuid>, String);

// ─── AppState ─────────────────────────────────────────────────────────────────

/// Top-level shared state injected into every axum handler.
#[derive(Clone)]
pub struct AppState {
    // ── Collaborators ─────────────────────────────────────────────────────────
    pub ledger: Arc<dyn Ledger>,
    pub quotes: Arc<dyn QuoteSource>,
    pub cache:  Arc<dyn PnlCache>,

    // ── Configuration snapshot (read fresh per tick via TickParams) ──────────
    pub config: Arc<EngineConfig>,

    // ── Realtime fan-out ──────────────────────────────────────────────────────
    pub broadcast_tx: broadcast::Sender<PushFrame>,

    // ── Engine mode / metrics ─────────────────────────────────────────────────
    /// Soft-disable flag: when false, ticks skip unless explicitly forced.
    pub engine_enabled: Arc<AtomicBool>,
    pub tick_count:  Arc<AtomicU64>,
    pub close_count: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        quotes: Arc<dyn QuoteSource>,
        cache: Arc<dyn PnlCache>,
        config: EngineConfig,
    ) -> Self {
        let (broadcast_tx, _) = broadcast::channel(256);

        Self {
            ledger,
            quotes,
            cache,
            config: Arc::new(config),
            broadcast_tx,
            engine_enabled: Arc::new(AtomicBool::new(true)),
            tick_count: Arc::new(AtomicU64::new(0)),
            close_count: Arc::new(AtomicU64::new(0)),
        }
    }

    // ── Helper methods ────────────────────────────────────────────────────────

    /// Broadcast an event to connected sockets. No listener is not an error
    /// (headless mode).
    pub fn broadcast(&self, event: &PushEvent) {
        let _ = self.broadcast_tx.send((event.user_scope(), event.to_json()));
    }

    pub fn is_enabled(&self) -> bool {
        self.engine_enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.engine_enabled.store(enabled, Ordering::Relaxed);
    }
}

/// Convenience type alias
pub type SharedState = Arc<AppState>;

pub fn build_state(
    ledger: Arc<dyn Ledger>,
    quotes: Arc<dyn QuoteSource>,
    cache: Arc<dyn PnlCache>,
    config: EngineConfig,
) -> SharedState {
    Arc::new(AppState::new(ledger, quotes, cache, config))
}
