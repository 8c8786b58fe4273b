//! # Ballast — Position & Risk Settlement Engine
//!
//! The subsystem behind a retail trading dashboard that keeps every open
//! position's P&L current, enforces stop-loss/target exits and per-account
//! loss-utilization limits, and performs the atomic, idempotent close —
//! correct even when the tick worker, a scheduled trigger and a user action
//! all race on the same position.
//!
//! ```text
//!  Tick Worker ──▶ Quote Normalizer ──▶ { Risk Evaluator, SL/TP Evaluator }
//!       │                                        │
//!       ▼                                        ▼
//!  cache + events ◀── clients        Position Closing Transaction ──▶ Ledger
//!       ▲
//!  Backstop Runner ── forces a tick when the heartbeat goes stale
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod models;
pub mod quotes;
pub mod routes;
pub mod state;
