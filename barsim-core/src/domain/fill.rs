//! Fill — a completed (full or partial) order execution.

use super::ids::{OrderId, TradeId};
use super::order::{OrderRole, OrderSide};
use serde::{Deserialize, Serialize};

/// Record of an order executing against a bar or sub-bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    /// Position the filling order references (SL/TP/EXIT orders only).
    pub parent_trade_id: Option<TradeId>,
    pub contract_id: String,
    pub side: OrderSide,
    pub role: OrderRole,
    pub price: f64,
    pub quantity: f64,
    /// Total commission for this fill (`commission_per_unit * quantity`).
    pub commission: f64,
    pub time: i64,
    pub bar_index: usize,
    /// Index of the sub-bar the fill occurred on (0 when the main bar was
    /// the sole matching slice).
    pub sub_bar_index: usize,
}

impl Fill {
    /// Signed cash delta: proceeds for sells, negative cost for buys,
    /// commission always subtracted.
    pub fn cash_delta(&self) -> f64 {
        let gross = self.price * self.quantity;
        match self.side {
            OrderSide::Buy => -gross - self.commission,
            OrderSide::Sell => gross - self.commission,
        }
    }
}
