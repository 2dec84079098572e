//! ClosedTrade — a completed round-trip, emitted when a position dies.

use super::ids::TradeId;
use super::order::{OrderRole, OrderSide};
use serde::{Deserialize, Serialize};

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    /// Closed by a strategy exit order.
    Signal,
    StopLoss,
    TakeProfit,
    /// Forced close (end of data, or operator intervention).
    Manual,
    /// Closed by an opposite-side entry that flipped the position.
    Reversal,
}

impl ExitReason {
    /// Reason implied by the closing order's role.
    pub fn from_role(role: OrderRole) -> Self {
        match role {
            OrderRole::StopLoss => ExitReason::StopLoss,
            OrderRole::TakeProfit => ExitReason::TakeProfit,
            OrderRole::Exit => ExitReason::Signal,
            OrderRole::Entry => ExitReason::Reversal,
        }
    }
}

/// A completed round-trip trade record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: TradeId,
    pub entry_time: i64,
    pub exit_time: i64,
    /// Weighted average entry price.
    pub entry_price: f64,
    /// Weighted average exit price.
    pub exit_price: f64,
    pub side: OrderSide,
    /// Total quantity that went through the position.
    pub size: f64,
    /// Total commission charged over the position's life.
    pub commission: f64,
    /// Net P&L (gross minus commission).
    pub profit_or_loss: f64,
    pub exit_reason: ExitReason,
}

impl ClosedTrade {
    pub fn is_winner(&self) -> bool {
        self.profit_or_loss > 0.0
    }

    /// P&L before commissions.
    pub fn gross_pnl(&self) -> f64 {
        self.profit_or_loss + self.commission
    }
}
