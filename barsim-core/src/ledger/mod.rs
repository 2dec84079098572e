//! Position & P&L accounting.
//!
//! The ledger consumes fills and maintains at most one open position per
//! contract. Same-side entry fills open or add (weighted-average entry);
//! opposite-side and SL/TP/EXIT fills reduce. Commission flows into
//! realized P&L at fill time, never post-hoc. When a position's size
//! reaches zero it is destroyed and a [`ClosedTrade`] is emitted.

use crate::bus::{EventBus, EventType, Payload};
use crate::domain::{
    ClosedTrade, ContractId, ExitReason, Fill, IdGen, OrderId, OrderRole, Position, TradeId,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

/// Size below which a position counts as fully closed.
const SIZE_EPSILON: f64 = 1e-9;

/// Fatal accounting errors. These abort the backtest.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(
        "fill for order {order_id} reduces {fill_qty} against position size {position_size}"
    )]
    InconsistentFill {
        order_id: OrderId,
        fill_qty: f64,
        position_size: f64,
    },

    #[error("fill for order {order_id} references no open position")]
    OrphanSlTp { order_id: OrderId },
}

/// What a fill did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Opened(TradeId),
    Added(TradeId),
    Reduced(TradeId),
    Closed(TradeId),
    /// Old position fully closed, excess quantity opened the other way.
    Reversed { closed: TradeId, opened: TradeId },
}

/// Position and balance accounting for the single-asset engine.
pub struct PositionLedger {
    bus: Rc<EventBus>,
    id_gen: Rc<RefCell<IdGen>>,
    positions: HashMap<ContractId, Position>,
    closed: Vec<ClosedTrade>,
    initial_balance: f64,
    /// Initial balance plus all realized P&L (commissions included).
    balance: f64,
}

impl PositionLedger {
    pub fn new(bus: Rc<EventBus>, id_gen: Rc<RefCell<IdGen>>, initial_balance: f64) -> Self {
        Self {
            bus,
            id_gen,
            positions: HashMap::new(),
            closed: Vec::new(),
            initial_balance,
            balance: initial_balance,
        }
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn unrealized_total(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    pub fn equity(&self) -> f64 {
        self.balance + self.unrealized_total()
    }

    pub fn position(&self, contract_id: &str) -> Option<&Position> {
        self.positions.get(contract_id)
    }

    pub fn position_by_trade_id(&self, trade_id: TradeId) -> Option<&Position> {
        self.positions.values().find(|p| p.id == trade_id)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn has_open_positions(&self) -> bool {
        !self.positions.is_empty()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    // ── Fill application ───────────────────────────────────────────────

    /// Apply a fill, mutating positions and balance and publishing the
    /// derived `PositionOpened` / `PositionClosed` events.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<LedgerOutcome, LedgerError> {
        let reduces_by_role = matches!(
            fill.role,
            OrderRole::StopLoss | OrderRole::TakeProfit | OrderRole::Exit
        );

        match self.positions.get(&fill.contract_id) {
            None => {
                if reduces_by_role {
                    return Err(LedgerError::OrphanSlTp {
                        order_id: fill.order_id,
                    });
                }
                Ok(self.open_new(fill, fill.quantity, fill.commission))
            }
            Some(pos) => {
                if reduces_by_role || fill.side != pos.side {
                    self.reduce(fill)
                } else {
                    Ok(self.add_to(fill))
                }
            }
        }
    }

    fn open_new(&mut self, fill: &Fill, quantity: f64, commission: f64) -> LedgerOutcome {
        let id = self.id_gen.borrow_mut().next_trade_id();
        let mut pos = Position::open(
            id,
            fill.contract_id.clone(),
            fill.side,
            quantity,
            fill.price,
            fill.time,
        );
        pos.realized_pnl -= commission;
        pos.commission_paid += commission;
        self.balance -= commission;

        self.bus.publish(
            EventType::PositionOpened,
            "ledger",
            Payload::Position(pos.clone()),
        );
        self.positions.insert(fill.contract_id.clone(), pos);
        LedgerOutcome::Opened(id)
    }

    fn add_to(&mut self, fill: &Fill) -> LedgerOutcome {
        let pos = self
            .positions
            .get_mut(&fill.contract_id)
            .expect("add_to requires an open position");
        let new_size = pos.size + fill.quantity;
        pos.average_entry_price =
            (pos.size * pos.average_entry_price + fill.quantity * fill.price) / new_size;
        pos.size = new_size;
        pos.total_entry_quantity += fill.quantity;
        pos.realized_pnl -= fill.commission;
        pos.commission_paid += fill.commission;
        pos.last_update_time = fill.time;
        self.balance -= fill.commission;

        let id = pos.id;
        let snapshot = pos.clone();
        self.bus.publish(
            EventType::MarketUpdate,
            "ledger",
            Payload::Position(snapshot),
        );
        LedgerOutcome::Added(id)
    }

    fn reduce(&mut self, fill: &Fill) -> Result<LedgerOutcome, LedgerError> {
        let pos = self
            .positions
            .get_mut(&fill.contract_id)
            .expect("reduce requires an open position");

        if let Some(parent) = fill.parent_trade_id {
            if parent != pos.id {
                return Err(LedgerError::OrphanSlTp {
                    order_id: fill.order_id,
                });
            }
        }

        let reduce_qty = fill.quantity.min(pos.size);
        let excess = fill.quantity - reduce_qty;
        // Only a reversing entry may carry quantity beyond the open size;
        // SL/TP/EXIT fills are capped by the matcher.
        if excess > SIZE_EPSILON && fill.role != OrderRole::Entry {
            return Err(LedgerError::InconsistentFill {
                order_id: fill.order_id,
                fill_qty: fill.quantity,
                position_size: pos.size,
            });
        }

        let per_unit_commission = if fill.quantity > 0.0 {
            fill.commission / fill.quantity
        } else {
            0.0
        };
        let reduce_commission = per_unit_commission * reduce_qty;

        let gross = if pos.side == crate::domain::OrderSide::Buy {
            (fill.price - pos.average_entry_price) * reduce_qty
        } else {
            (pos.average_entry_price - fill.price) * reduce_qty
        };

        pos.realized_pnl += gross - reduce_commission;
        pos.commission_paid += reduce_commission;
        pos.size -= reduce_qty;
        pos.exit_quantity += reduce_qty;
        pos.exit_value += fill.price * reduce_qty;
        pos.last_update_time = fill.time;
        self.balance += gross - reduce_commission;

        let id = pos.id;
        if pos.size <= SIZE_EPSILON {
            let trade = Self::close_record(pos, fill.time, ExitReason::from_role(fill.role));
            self.positions.remove(&fill.contract_id);
            self.closed.push(trade.clone());
            self.bus
                .publish(EventType::PositionClosed, "ledger", Payload::Closed(trade));

            if excess > SIZE_EPSILON {
                let opened = self.open_new(fill, excess, per_unit_commission * excess);
                let LedgerOutcome::Opened(opened_id) = opened else {
                    unreachable!("open_new always opens");
                };
                return Ok(LedgerOutcome::Reversed {
                    closed: id,
                    opened: opened_id,
                });
            }
            Ok(LedgerOutcome::Closed(id))
        } else {
            let snapshot = pos.clone();
            self.bus.publish(
                EventType::MarketUpdate,
                "ledger",
                Payload::Position(snapshot),
            );
            Ok(LedgerOutcome::Reduced(id))
        }
    }

    fn close_record(pos: &Position, exit_time: i64, exit_reason: ExitReason) -> ClosedTrade {
        ClosedTrade {
            id: pos.id,
            entry_time: pos.entry_time,
            exit_time,
            entry_price: pos.average_entry_price,
            exit_price: pos.weighted_exit_price(),
            side: pos.side,
            size: pos.total_entry_quantity,
            commission: pos.commission_paid,
            profit_or_loss: pos.realized_pnl,
            exit_reason,
        }
    }

    // ── Mark-to-market & forced close ──────────────────────────────────

    /// Recompute each open position's unrealized P&L against `price`.
    pub fn update_marks(&mut self, price: f64, time: i64) {
        for pos in self.positions.values_mut() {
            pos.update_mark(price, time);
        }
    }

    /// Force-close the position on `contract_id` at `price` (no commission;
    /// there is no closing order). Used for end-of-data manual closes.
    pub fn close_position(
        &mut self,
        contract_id: &str,
        price: f64,
        time: i64,
        reason: ExitReason,
    ) -> Option<ClosedTrade> {
        let mut pos = self.positions.remove(contract_id)?;
        let gross = pos.unrealized_at(price);
        pos.realized_pnl += gross;
        pos.exit_quantity += pos.size;
        pos.exit_value += price * pos.size;
        pos.size = 0.0;
        pos.unrealized_pnl = 0.0;
        self.balance += gross;

        let trade = Self::close_record(&pos, time, reason);
        self.closed.push(trade.clone());
        self.bus.publish(
            EventType::PositionClosed,
            "ledger",
            Payload::Closed(trade.clone()),
        );
        Some(trade)
    }

    /// Restore the ledger to its initial state.
    pub fn reset(&mut self) {
        self.positions.clear();
        self.closed.clear();
        self.balance = self.initial_balance;
    }
}
