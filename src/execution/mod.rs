// =============================================================================
// Execution — simulated order lifecycle against cached market depth
// =============================================================================

pub mod config;
pub mod engine;
pub mod fills;
pub mod latency;
pub mod oracle;
pub mod slippage;

pub use config::ExecutionConfig;
pub use engine::ExecutionEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OrderStatus, OrderType, ProductType, Side};

// ---------------------------------------------------------------------------
// Order record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    /// External reference (UUID v4) surfaced to clients.
    pub order_ref: String,
    pub user_id: i64,
    pub symbol: String,
    pub exchange_segment: String,
    pub side: Side,
    pub quantity: i64,
    pub filled_qty: i64,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub price: f64,
    pub trigger_price: Option<f64>,
    // Super-order fields: bracket target / stop / trailing jump.
    pub is_super: bool,
    pub target_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub trailing_jump: Option<f64>,
    pub status: OrderStatus,
    pub remarks: Option<String>,
    /// Set when the order was accepted with insufficient margin (the
    /// compatibility quirk: shortfall warns, never rejects).
    pub margin_warning: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining(&self) -> i64 {
        (self.quantity - self.filled_qty).max(0)
    }
}

// ---------------------------------------------------------------------------
// Trade & execution events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub order_id: i64,
    pub user_id: i64,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub qty: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Accepted,
    PartialFill,
    FullFill,
    Rejected,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => write!(f, "ACCEPTED"),
            Self::PartialFill => write!(f, "PARTIAL_FILL"),
            Self::FullFill => write!(f, "FULL_FILL"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Audit record emitted for every order transition worth observing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub order_id: i64,
    pub user_id: i64,
    pub symbol: String,
    pub kind: EventKind,
    pub decision_price: Option<f64>,
    pub fill_price: Option<f64>,
    pub fill_qty: Option<i64>,
    pub reason: Option<String>,
    pub latency_ms: Option<u64>,
    pub slippage: Option<f64>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Basket orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasketLeg {
    pub symbol: String,
    pub exchange_segment: String,
    pub side: Side,
    pub quantity: i64,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Basket {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub legs: Vec<BasketLeg>,
    pub created_at: DateTime<Utc>,
}
