//! # routes
//!
//! Axum handlers: the engine invocation surface, the positions API and the
//! WebSocket monitor stream.

pub mod engine;
pub mod monitor;
pub mod positions;
