//! # models
//!
//! Domain objects shared by the settlement engine, the ledger adapters and
//! the HTTP surface.

pub mod heartbeat;
pub mod position;

pub use heartbeat::{Heartbeat, HeartbeatRole};
pub use position::{
    AlertLevel, Order, OrderSide, OrderStatus, Position, PositionStatus, ProductType, RiskAlert,
    Segment, TradingAccount,
};
