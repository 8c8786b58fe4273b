//! # models::position
//!
//! Defines the durable trading objects the engine settles against:
//! [`Position`], the offsetting exit [`Order`], the owning
//! [`TradingAccount`], and the append-only [`RiskAlert`].
//!
//! A position's status is never stored independently — it is *derived* from
//! the signed quantity (`quantity != 0` ⇔ OPEN). Closed positions are kept
//! forever as history; `realized_pnl` is written exactly once, at close.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Market segment / product type ───────────────────────────────────────────

/// Exchange segment an instrument trades on. Drives the leverage policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Segment {
    Equity,
    Derivatives,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Equity => "EQUITY",
            Segment::Derivatives => "DERIVATIVES",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EQUITY" => Some(Segment::Equity),
            "DERIVATIVES" => Some(Segment::Derivatives),
            _ => None,
        }
    }
}

/// Product type chosen at order entry. Intraday positions carry leverage,
/// delivery positions block full notional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    Intraday,
    Delivery,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Intraday => "INTRADAY",
            ProductType::Delivery => "DELIVERY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INTRADAY" => Some(ProductType::Intraday),
            "DELIVERY" => Some(ProductType::Delivery),
            _ => None,
        }
    }
}

// ─── Order ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Executed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Executed => "EXECUTED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "EXECUTED" => Some(OrderStatus::Executed),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

/// One order row. The engine only ever *creates* exit orders (opposite side,
/// full quantity, immediately executed); entry orders are read back to
/// recover the product type used when margin was blocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id:           Uuid,
    pub account_id:   Uuid,
    pub symbol:       String,
    pub side:         OrderSide,
    /// Always positive — direction lives in `side`.
    pub quantity:     i64,
    pub price:        f64,
    pub product_type: ProductType,
    pub status:       OrderStatus,
    pub executed_at:  Option<DateTime<Utc>>,
    pub created_at:   DateTime<Utc>,
}

// ─── Position ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// One net holding in one instrument for one trading account.
///
/// `quantity` is signed: positive = long, negative = short, zero = closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id:               Uuid,
    pub account_id:       Uuid,
    pub user_id:          Uuid,
    pub symbol:           String,
    /// Instrument token the quote feed keys on.
    pub instrument_token: i64,
    pub segment:          Segment,
    pub quantity:         i64,
    /// Average entry price; > 0 while the position is open.
    pub average_price:    f64,
    pub stop_loss:        Option<f64>,
    pub target:           Option<f64>,
    /// Last price the engine marked this instrument at (fallback source).
    pub last_price:       Option<f64>,
    pub unrealized_pnl:   f64,
    pub day_pnl:          f64,
    /// Set exactly once, when the position closes. Immutable afterwards.
    pub realized_pnl:     Option<f64>,
    /// Contract lot size; 1 for equity, contract-specific for derivatives.
    pub lot_size:         i64,
    pub created_at:       DateTime<Utc>,
    pub updated_at:       DateTime<Utc>,
    pub closed_at:        Option<DateTime<Utc>>,
}

impl Position {
    /// Status is derived, never stored authoritative: quantity != 0 ⇔ OPEN.
    #[inline]
    pub fn status(&self) -> PositionStatus {
        if self.quantity != 0 {
            PositionStatus::Open
        } else {
            PositionStatus::Closed
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.quantity != 0
    }

    /// Side of the offsetting order that would flatten this position.
    #[inline]
    pub fn exit_side(&self) -> OrderSide {
        if self.quantity > 0 {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }
}

// ─── TradingAccount ───────────────────────────────────────────────────────────

/// Account balance view. The engine mutates it only through margin release
/// and realized-P&L settlement inside the close transaction; funds transfers
/// belong to an external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingAccount {
    pub id:               Uuid,
    pub user_id:          Uuid,
    pub balance:          f64,
    pub available_margin: f64,
    pub used_margin:      f64,
}

impl TradingAccount {
    /// Denominator of loss utilization.
    #[inline]
    pub fn total_funds(&self) -> f64 {
        self.balance + self.available_margin
    }
}

// ─── RiskAlert ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WARNING" => Some(AlertLevel::Warning),
            "CRITICAL" => Some(AlertLevel::Critical),
            _ => None,
        }
    }
}

/// Append-only record of a loss-utilization breach. Insertion is throttled
/// per account by the ledger (cooldown window) to avoid alert storms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAlert {
    pub id:               Uuid,
    pub account_id:       Uuid,
    pub level:            AlertLevel,
    pub loss_utilization: f64,
    pub message:          String,
    pub created_at:       DateTime<Utc>,
}

impl RiskAlert {
    pub fn new(account_id: Uuid, level: AlertLevel, loss_utilization: f64, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            level,
            loss_utilization,
            message,
            created_at: Utc::now(),
        }
    }
}
