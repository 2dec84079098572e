//! Position — an open holding in the traded contract.

use super::ids::TradeId;
use super::order::OrderSide;
use serde::{Deserialize, Serialize};

/// An open position, created by the first opening fill and destroyed when
/// its size returns to zero.
///
/// Besides the live fields the ledger needs (size, weighted average entry,
/// running P&L), the position accumulates the exit-side totals used to
/// build the [`ClosedTrade`](super::trade::ClosedTrade) record on close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: TradeId,
    pub contract_id: String,
    /// Direction of the holding: `Buy` = long, `Sell` = short.
    pub side: OrderSide,
    pub size: f64,
    pub average_entry_price: f64,
    pub unrealized_pnl: f64,
    /// Realized P&L net of all commissions charged so far (entry legs
    /// included).
    pub realized_pnl: f64,
    pub entry_time: i64,
    pub last_update_time: i64,
    /// Total quantity ever opened into this position (adds included).
    pub total_entry_quantity: f64,
    /// Total commission charged across all fills of this position.
    pub commission_paid: f64,
    /// Quantity closed out so far.
    pub exit_quantity: f64,
    /// Sum of `price * quantity` over exit fills, for the weighted exit price.
    pub exit_value: f64,
}

impl Position {
    pub fn open(
        id: TradeId,
        contract_id: impl Into<String>,
        side: OrderSide,
        size: f64,
        entry_price: f64,
        time: i64,
    ) -> Self {
        Self {
            id,
            contract_id: contract_id.into(),
            side,
            size,
            average_entry_price: entry_price,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            entry_time: time,
            last_update_time: time,
            total_entry_quantity: size,
            commission_paid: 0.0,
            exit_quantity: 0.0,
            exit_value: 0.0,
        }
    }

    pub fn is_long(&self) -> bool {
        self.side == OrderSide::Buy
    }

    /// Unrealized P&L against a reference price.
    pub fn unrealized_at(&self, price: f64) -> f64 {
        if self.is_long() {
            (price - self.average_entry_price) * self.size
        } else {
            (self.average_entry_price - price) * self.size
        }
    }

    /// Mark the position to a reference price, refreshing `unrealized_pnl`.
    pub fn update_mark(&mut self, price: f64, time: i64) {
        self.unrealized_pnl = self.unrealized_at(price);
        self.last_update_time = time;
    }

    /// Volume-weighted exit price over the exits recorded so far.
    pub fn weighted_exit_price(&self) -> f64 {
        if self.exit_quantity > 0.0 {
            self.exit_value / self.exit_quantity
        } else {
            0.0
        }
    }
}
