//! # engine
//!
//! The settlement engine proper. The inner ring — pricing, margin, risk,
//! triggers — is pure and error-free by construction; the outer ring —
//! close, tick, backstop — orchestrates I/O and absorbs partial failure.

pub mod backstop;
pub mod close;
pub mod margin;
pub mod pricing;
pub mod risk;
pub mod tick;
pub mod triggers;
