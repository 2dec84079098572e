//! Order types and the order lifecycle state machine.

use super::ids::{OrderId, TradeId};
use serde::{Deserialize, Serialize};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Execution style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    /// Fill at the current matching slice's open.
    Market,
    /// Fill at `limit_price` when the slice range reaches it.
    Limit,
    /// Fill at `stop_price` when the slice range penetrates it.
    Stop,
}

/// What the order is for, relative to a position.
///
/// `StopLoss` and `TakeProfit` orders protect an open position and must
/// reference it via `parent_trade_id`; they are matched as an OCO pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderRole {
    Entry,
    StopLoss,
    TakeProfit,
    Exit,
}

/// Order lifecycle states.
///
/// Transitions are monotone: `Pending → {PartiallyFilled → Filled} |
/// Cancelled | Rejected`. Terminal states never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// A single order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// Position this SL/TP/EXIT order references.
    pub parent_trade_id: Option<TradeId>,
    pub contract_id: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub submitted_time: i64,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    /// Volume-weighted price across this order's fills.
    pub filled_price: Option<f64>,
    pub filled_time: Option<i64>,
    pub commission_per_unit: f64,
    pub role: OrderRole,
    /// Diagnostic set on rejection or cancellation.
    pub message: Option<String>,
}

impl Order {
    pub fn remaining_quantity(&self) -> f64 {
        self.quantity - self.filled_quantity
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Pending | OrderStatus::PartiallyFilled
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// The price this order executes at under the strict-price fill policy.
    /// `None` for market orders (they take the slice open).
    pub fn own_price(&self) -> Option<f64> {
        match self.order_type {
            OrderType::Market => None,
            OrderType::Limit => self.limit_price,
            OrderType::Stop => self.stop_price,
        }
    }
}

/// What a strategy (or test) submits; the book assigns id, time, status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub contract_id: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub role: OrderRole,
    pub parent_trade_id: Option<TradeId>,
}

impl OrderDraft {
    pub fn market(contract_id: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Self {
            contract_id: contract_id.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            stop_price: None,
            role: OrderRole::Entry,
            parent_trade_id: None,
        }
    }

    pub fn limit(
        contract_id: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        limit_price: f64,
    ) -> Self {
        Self {
            contract_id: contract_id.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(limit_price),
            stop_price: None,
            role: OrderRole::Entry,
            parent_trade_id: None,
        }
    }

    pub fn stop(
        contract_id: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Self {
        Self {
            contract_id: contract_id.into(),
            side,
            order_type: OrderType::Stop,
            quantity,
            limit_price: None,
            stop_price: Some(stop_price),
            role: OrderRole::Entry,
            parent_trade_id: None,
        }
    }

    /// Stop-loss protecting the given position. A SL is always a stop order
    /// on the opposite side of the position.
    pub fn stop_loss(
        contract_id: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        parent_trade_id: TradeId,
    ) -> Self {
        Self {
            role: OrderRole::StopLoss,
            parent_trade_id: Some(parent_trade_id),
            ..Self::stop(contract_id, side, quantity, stop_price)
        }
    }

    /// Take-profit protecting the given position. A TP is always a limit
    /// order on the opposite side of the position.
    pub fn take_profit(
        contract_id: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        limit_price: f64,
        parent_trade_id: TradeId,
    ) -> Self {
        Self {
            role: OrderRole::TakeProfit,
            parent_trade_id: Some(parent_trade_id),
            ..Self::limit(contract_id, side, quantity, limit_price)
        }
    }

    pub fn with_role(mut self, role: OrderRole) -> Self {
        self.role = role;
        self
    }
}

/// Requested change to a resting order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyRequest {
    pub order_id: OrderId,
    pub quantity: Option<f64>,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
}

/// Round a price to the nearest multiple of `tick_size` (half rounds up).
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 || price.is_nan() {
        return price;
    }
    (price / tick_size).round() * tick_size
}
