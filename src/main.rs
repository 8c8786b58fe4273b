//! # Ballast — Position & Risk Settlement Engine
//!
//! ```text
//!  ┌─────────────┐  tokio interval             ┌─────────────────────────────┐
//!  │  Tick Loop  │ ──────────────────────────▶ │ AppState                    │
//!  └─────────────┘                             │ ├─ ledger (Postgres/memory) │
//!  ┌─────────────┐  POST /api/engine/tick      │ ├─ quote source             │
//!  │  Scheduler  │ ──────────────────────────▶ │ ├─ pnl cache                │
//!  └─────────────┘  POST /api/engine/backstop  │ └─ broadcast_tx ──────────┐ │
//!  ┌─────────────┐  POST /api/positions/:id/   └───────────────────────────│─┘
//!  │  Dashboard  │       close                                             │
//!  └─────────────┘  ws://host/ws/monitor  ◀──────────────────────────────── ┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ballast::auth::require_api_key;
use ballast::cache::{InMemoryPnlCache, NoopPnlCache, PnlCache};
use ballast::config::EngineConfig;
use ballast::engine::tick::{process_tick, TickParams};
use ballast::ledger::{memory::MemLedger, postgres::PgLedger, Ledger};
use ballast::quotes::{HttpQuoteSource, QuoteSource, StaticQuoteSource};
use ballast::routes::{
    engine::{get_heartbeats, get_status, pause_engine, resume_engine, run_backstop_check, run_tick},
    monitor::ws_monitor,
    positions::{close_position, get_position_pnl, list_open_positions},
};
use ballast::state::{build_state, SharedState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("ballast=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(r#"

  ╔═══════════════════════════════════════════════════════╗
  ║          BALLAST — Position & Risk Settlement          ║
  ║   Marks · Margin · Stop-Loss · Risk Caps · Backstop    ║
  ╚═══════════════════════════════════════════════════════╝"#);

    // ── 3. Collaborators ──────────────────────────────────────────────────────
    let config = EngineConfig::from_env();

    let ledger: Arc<dyn Ledger> = match std::env::var("LEDGER_BACKEND").as_deref() {
        Ok("memory") => {
            warn!("🎭 LEDGER_BACKEND=memory — running on the in-memory ledger");
            Arc::new(MemLedger::new())
        }
        _ => {
            let database_url = std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL not set (or use LEDGER_BACKEND=memory)"))?;
            Arc::new(PgLedger::connect(&database_url).await?)
        }
    };

    let quote_feed_url = std::env::var("QUOTE_FEED_URL").unwrap_or_else(|_| "mock".to_string());
    let quotes: Arc<dyn QuoteSource> = if quote_feed_url == "mock" {
        warn!("🎭 QUOTE_FEED_URL=mock — quotes resolve from stored prices only");
        Arc::new(StaticQuoteSource::new())
    } else {
        Arc::new(HttpQuoteSource::new(
            reqwest::Client::new(),
            quote_feed_url,
            config.quote_timeout_ms,
        ))
    };

    let cache: Arc<dyn PnlCache> = match std::env::var("PNL_CACHE").as_deref() {
        Ok("off") => {
            warn!("PNL_CACHE=off — low-latency read path disabled");
            Arc::new(NoopPnlCache)
        }
        _ => Arc::new(InMemoryPnlCache::new()),
    };

    let state = build_state(ledger, quotes, cache, config);

    // ── 4. In-process tick loop ───────────────────────────────────────────────
    spawn_tick_loop(state.clone());

    // ── 5. CORS ───────────────────────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // ── 6. Router ─────────────────────────────────────────────────────────────
    let app = Router::new()
        // ── Engine invocation surface ─────────────────────────────────────────
        .route("/api/engine/tick",      post(run_tick))
        .route("/api/engine/backstop",  post(run_backstop_check))
        .route("/api/engine/heartbeat", get(get_heartbeats))
        .route("/api/engine/pause",     post(pause_engine))
        .route("/api/engine/resume",    post(resume_engine))
        .route("/api/engine/status",    get(get_status))
        // ── Positions ─────────────────────────────────────────────────────────
        .route("/api/positions",            get(list_open_positions))
        .route("/api/positions/:id/pnl",    get(get_position_pnl))
        .route("/api/positions/:id/close",  post(close_position))
        // ── Monitor ───────────────────────────────────────────────────────────
        .route("/ws/monitor", get(ws_monitor))
        .route("/health",     get(|| async { "ok" }))
        // ── Middleware ────────────────────────────────────────────────────────
        .layer(axum::middleware::from_fn(require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    // ── 7. Bind & Serve ───────────────────────────────────────────────────────
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
        .parse()?;

    info!(?addr, "🚀 Ballast server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodic worker. `TICK_INTERVAL_SECS=0` disables it — external
/// schedulers then drive `POST /api/engine/tick` instead, and the backstop
/// covers the gaps either way.
fn spawn_tick_loop(state: SharedState) {
    let interval_secs = state.config.tick_interval_secs;
    if interval_secs == 0 {
        info!("Tick loop disabled (TICK_INTERVAL_SECS=0) — expecting external triggers");
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs, "⏱️ Tick loop started");

        loop {
            interval.tick().await;
            let params = TickParams::from_config(&state.config);
            // process_tick never panics or errors out: failures land in the
            // report and heartbeat, and the next interval retries.
            let _ = process_tick(&state, &params).await;
        }
    });
}
