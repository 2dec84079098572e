//! Order book & matching engine.
//!
//! Holds pending orders FIFO by submission time and matches them against
//! each bar (or its sub-bar refinements) in a fixed three-step sequence:
//!
//! 1. Standalone stop orders (entry/exit stops, not SL/TP)
//! 2. Market and limit orders (entry/exit)
//! 3. OCO stop-loss / take-profit pairs against each open position
//!
//! Fill prices are strict: a limit fills at its limit price, a stop at its
//! stop price, a market order at the matching slice's open. No favorable
//! slippage is modeled.

use crate::bus::{EventBus, EventType, Payload};
use crate::domain::{
    round_to_tick, Bar, Fill, IdGen, ModifyRequest, Order, OrderDraft, OrderId, OrderRole,
    OrderSide, OrderStatus, OrderType, SubBar, TradeId,
};
use crate::ledger::{LedgerError, LedgerOutcome, PositionLedger};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

const QTY_EPSILON: f64 = 1e-9;

/// Matching-engine errors. `UnknownOrder` / `OrderNotActive` surface to the
/// caller; `InconsistentFill` and ledger errors are fatal to the run.
#[derive(Debug, Error)]
pub enum BookError {
    #[error("order {0} not found")]
    UnknownOrder(OrderId),

    #[error("order {0} is not active")]
    OrderNotActive(OrderId),

    #[error("fill of {quantity} exceeds remaining {remaining} on order {order_id}")]
    InconsistentFill {
        order_id: OrderId,
        quantity: f64,
        remaining: f64,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// The order book: pending orders plus the matching sequence.
pub struct OrderBook {
    bus: Rc<EventBus>,
    id_gen: Rc<RefCell<IdGen>>,
    /// Every order ever accepted, keyed by id. Terminal orders stay for
    /// lookup; only the pending queue is swept per bar.
    orders: HashMap<OrderId, Order>,
    /// Active order ids, FIFO by submission.
    queue: Vec<OrderId>,
    tick_size: f64,
    commission_per_unit: f64,
}

impl OrderBook {
    pub fn new(
        bus: Rc<EventBus>,
        id_gen: Rc<RefCell<IdGen>>,
        tick_size: f64,
        commission_per_unit: f64,
    ) -> Self {
        Self {
            bus,
            id_gen,
            orders: HashMap::new(),
            queue: Vec::new(),
            tick_size,
            commission_per_unit,
        }
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    /// Active orders in FIFO order.
    pub fn pending_orders(&self) -> Vec<&Order> {
        self.queue
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| o.is_active())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.pending_orders().len()
    }

    pub fn has_active_orders(&self) -> bool {
        self.queue
            .iter()
            .filter_map(|id| self.orders.get(id))
            .any(|o| o.is_active())
    }

    // ── Submission ─────────────────────────────────────────────────────

    /// Validate and accept a draft. Invalid drafts come back `Rejected`
    /// with a populated message and are not added to the book.
    pub fn submit(&mut self, draft: OrderDraft) -> Order {
        let id = self.id_gen.borrow_mut().next_order_id();
        let now = self.bus.now();
        let mut order = Order {
            id,
            parent_trade_id: draft.parent_trade_id,
            contract_id: draft.contract_id,
            side: draft.side,
            order_type: draft.order_type,
            quantity: draft.quantity,
            limit_price: draft.limit_price.map(|p| round_to_tick(p, self.tick_size)),
            stop_price: draft.stop_price.map(|p| round_to_tick(p, self.tick_size)),
            submitted_time: now,
            status: OrderStatus::Pending,
            filled_quantity: 0.0,
            filled_price: None,
            filled_time: None,
            commission_per_unit: self.commission_per_unit,
            role: draft.role,
            message: None,
        };

        if let Some(reason) = Self::validation_failure(&order) {
            order.status = OrderStatus::Rejected;
            order.message = Some(reason.to_string());
            self.bus.publish(
                EventType::OrderRejected,
                "order_book",
                Payload::Order(order.clone()),
            );
            return order;
        }

        self.orders.insert(id, order.clone());
        self.queue.push(id);
        self.bus.publish(
            EventType::OrderSubmitted,
            "order_book",
            Payload::Order(order.clone()),
        );
        order
    }

    fn validation_failure(order: &Order) -> Option<&'static str> {
        if !(order.quantity > 0.0) {
            return Some("Invalid quantity");
        }
        if order.order_type == OrderType::Limit && order.limit_price.is_none() {
            return Some("Missing limit price");
        }
        if order.order_type == OrderType::Stop && order.stop_price.is_none() {
            return Some("Missing stop price");
        }
        match order.role {
            OrderRole::StopLoss => {
                if order.order_type != OrderType::Stop {
                    return Some("Stop-loss must be a stop order");
                }
                if order.parent_trade_id.is_none() {
                    return Some("Stop-loss requires a parent trade");
                }
            }
            OrderRole::TakeProfit => {
                if order.order_type != OrderType::Limit {
                    return Some("Take-profit must be a limit order");
                }
                if order.parent_trade_id.is_none() {
                    return Some("Take-profit requires a parent trade");
                }
            }
            OrderRole::Entry | OrderRole::Exit => {}
        }
        None
    }

    // ── Cancellation & modification ────────────────────────────────────

    /// Cancel an order. Returns `false` for unknown or already-terminal
    /// orders (not fatal).
    pub fn cancel(&mut self, id: OrderId) -> bool {
        self.cancel_with_reason(id, "cancelled")
    }

    fn cancel_with_reason(&mut self, id: OrderId, reason: &str) -> bool {
        let Some(order) = self.orders.get_mut(&id) else {
            return false;
        };
        if !order.is_active() {
            return false;
        }
        order.status = OrderStatus::Cancelled;
        order.message = Some(reason.to_string());
        let snapshot = order.clone();
        self.bus.publish(
            EventType::OrderCancelled,
            "order_book",
            Payload::Order(snapshot),
        );
        true
    }

    /// Cancel every active order referencing `trade_id`.
    pub fn cancel_all_by_trade(&mut self, trade_id: TradeId) {
        let ids: Vec<OrderId> = self
            .queue
            .iter()
            .filter(|id| {
                self.orders
                    .get(id)
                    .is_some_and(|o| o.is_active() && o.parent_trade_id == Some(trade_id))
            })
            .copied()
            .collect();
        for id in ids {
            self.cancel_with_reason(id, "parent position closed");
        }
    }

    /// Cancel every active order, or only those on `contract_id` when given.
    pub fn cancel_all_by_contract(&mut self, contract_id: Option<&str>) {
        let ids: Vec<OrderId> = self
            .queue
            .iter()
            .filter(|id| {
                self.orders.get(id).is_some_and(|o| {
                    o.is_active() && contract_id.map_or(true, |c| o.contract_id == c)
                })
            })
            .copied()
            .collect();
        for id in ids {
            self.cancel_with_reason(id, "cancelled");
        }
    }

    /// Change price and/or quantity of a resting order. Quantity cannot be
    /// reduced below what is already filled.
    pub fn modify(&mut self, req: &ModifyRequest) -> Result<(), BookError> {
        let tick_size = self.tick_size;
        let order = self
            .orders
            .get_mut(&req.order_id)
            .ok_or(BookError::UnknownOrder(req.order_id))?;
        if !order.is_active() {
            return Err(BookError::OrderNotActive(req.order_id));
        }
        if let Some(qty) = req.quantity {
            if qty <= order.filled_quantity {
                return Err(BookError::InconsistentFill {
                    order_id: req.order_id,
                    quantity: qty,
                    remaining: order.remaining_quantity(),
                });
            }
            order.quantity = qty;
        }
        if let Some(limit) = req.limit_price {
            order.limit_price = Some(round_to_tick(limit, tick_size));
        }
        if let Some(stop) = req.stop_price {
            order.stop_price = Some(round_to_tick(stop, tick_size));
        }
        let snapshot = order.clone();
        self.bus.publish(
            EventType::OrderSubmitted,
            "order_book",
            Payload::Order(snapshot),
        );
        Ok(())
    }

    // ── Fill recording ─────────────────────────────────────────────────

    /// Record a fill decided outside the matcher (partial fills driven by a
    /// caller). Updates the order state machine and publishes `OrderFilled`;
    /// the caller routes the returned fill into the ledger.
    pub fn record_fill(
        &mut self,
        order_id: OrderId,
        quantity: f64,
        price: f64,
        bar_index: usize,
        sub_bar_index: usize,
    ) -> Result<Fill, BookError> {
        let order = self
            .orders
            .get(&order_id)
            .ok_or(BookError::UnknownOrder(order_id))?;
        if !order.is_active() {
            return Err(BookError::OrderNotActive(order_id));
        }
        if quantity > order.remaining_quantity() + QTY_EPSILON {
            return Err(BookError::InconsistentFill {
                order_id,
                quantity,
                remaining: order.remaining_quantity(),
            });
        }
        Ok(self.execute_fill(order_id, quantity, price, bar_index, sub_bar_index, false))
    }

    /// Apply a fill to an order and publish `OrderFilled`. When
    /// `cancel_remainder` is set, any unfilled remainder is cancelled and
    /// the order goes terminal.
    fn execute_fill(
        &mut self,
        order_id: OrderId,
        quantity: f64,
        price: f64,
        bar_index: usize,
        sub_bar_index: usize,
        cancel_remainder: bool,
    ) -> Fill {
        let now = self.bus.now();
        let order = self
            .orders
            .get_mut(&order_id)
            .expect("execute_fill on known order");

        let prior_value = order.filled_price.unwrap_or(0.0) * order.filled_quantity;
        order.filled_quantity += quantity;
        order.filled_price = Some((prior_value + price * quantity) / order.filled_quantity);
        order.filled_time = Some(now);
        let mut remainder_cancelled = false;
        if order.remaining_quantity() <= QTY_EPSILON {
            order.status = OrderStatus::Filled;
        } else if cancel_remainder {
            order.status = OrderStatus::Cancelled;
            order.message = Some("remainder cancelled".to_string());
            remainder_cancelled = true;
        } else {
            order.status = OrderStatus::PartiallyFilled;
        }
        let order_snapshot = remainder_cancelled.then(|| order.clone());

        let fill = Fill {
            order_id,
            parent_trade_id: order.parent_trade_id,
            contract_id: order.contract_id.clone(),
            side: order.side,
            role: order.role,
            price,
            quantity,
            commission: order.commission_per_unit * quantity,
            time: now,
            bar_index,
            sub_bar_index,
        };
        self.bus
            .publish(EventType::OrderFilled, "order_book", Payload::Fill(fill.clone()));
        if let Some(snapshot) = order_snapshot {
            self.bus.publish(
                EventType::OrderCancelled,
                "order_book",
                Payload::Order(snapshot),
            );
        }
        fill
    }

    // ── Matching ───────────────────────────────────────────────────────

    /// Match all pending orders against one bar. If `sub_bars` is empty the
    /// main bar acts as the sole matching slice. After the last slice, open
    /// positions are marked to the main bar's close and terminal orders are
    /// swept from the pending queue.
    pub fn process_bar(
        &mut self,
        bar: &Bar,
        sub_bars: &[SubBar],
        bar_index: usize,
        ledger: &mut PositionLedger,
    ) -> Result<Vec<Fill>, BookError> {
        let synthetic;
        let slices: &[SubBar] = if sub_bars.is_empty() {
            synthetic = [SubBar::from_bar(bar, bar_index)];
            &synthetic
        } else {
            sub_bars
        };

        let mut fills = Vec::new();
        for (sub_bar_index, slice) in slices.iter().enumerate() {
            self.match_standalone_stops(slice, bar_index, sub_bar_index, ledger, &mut fills)?;
            self.match_market_and_limit(slice, bar_index, sub_bar_index, ledger, &mut fills)?;
            self.match_oco_pairs(slice, bar_index, sub_bar_index, ledger, &mut fills)?;
        }

        ledger.update_marks(bar.close, bar.time);
        self.sweep_terminal();
        Ok(fills)
    }

    /// Step 1: standalone stop orders (entry/exit, not SL/TP).
    fn match_standalone_stops(
        &mut self,
        slice: &SubBar,
        bar_index: usize,
        sub_bar_index: usize,
        ledger: &mut PositionLedger,
        fills: &mut Vec<Fill>,
    ) -> Result<(), BookError> {
        for id in self.queue.clone() {
            let Some(order) = self.orders.get(&id) else {
                continue;
            };
            if !order.is_active()
                || order.order_type != OrderType::Stop
                || !matches!(order.role, OrderRole::Entry | OrderRole::Exit)
            {
                continue;
            }
            let stop = order.stop_price.expect("stop order carries stop price");
            if !stop_hit(order.side, stop, slice) {
                continue;
            }
            self.fill_and_settle(id, stop, bar_index, sub_bar_index, ledger, fills)?;
        }
        Ok(())
    }

    /// Step 2: market and limit orders (entry/exit, not SL/TP).
    fn match_market_and_limit(
        &mut self,
        slice: &SubBar,
        bar_index: usize,
        sub_bar_index: usize,
        ledger: &mut PositionLedger,
        fills: &mut Vec<Fill>,
    ) -> Result<(), BookError> {
        for id in self.queue.clone() {
            let Some(order) = self.orders.get(&id) else {
                continue;
            };
            if !order.is_active() || !matches!(order.role, OrderRole::Entry | OrderRole::Exit) {
                continue;
            }
            let price = match order.order_type {
                OrderType::Market => slice.open,
                OrderType::Limit => {
                    let limit = order.limit_price.expect("limit order carries limit price");
                    if !limit_hit(order.side, limit, slice) {
                        continue;
                    }
                    limit
                }
                OrderType::Stop => continue,
            };
            self.fill_and_settle(id, price, bar_index, sub_bar_index, ledger, fills)?;
        }
        Ok(())
    }

    /// Step 3: OCO SL/TP evaluation against each open position.
    fn match_oco_pairs(
        &mut self,
        slice: &SubBar,
        bar_index: usize,
        sub_bar_index: usize,
        ledger: &mut PositionLedger,
        fills: &mut Vec<Fill>,
    ) -> Result<(), BookError> {
        // Deterministic position order: by trade id.
        let mut trade_ids: Vec<TradeId> = ledger.open_positions().map(|p| p.id).collect();
        trade_ids.sort();

        for trade_id in trade_ids {
            // The position may have been closed by an earlier pair this slice.
            if ledger.position_by_trade_id(trade_id).is_none() {
                continue;
            }
            let sl = self.find_protective(trade_id, OrderRole::StopLoss);
            let tp = self.find_protective(trade_id, OrderRole::TakeProfit);
            if sl.is_none() && tp.is_none() {
                continue;
            }

            let sl_hit = sl.is_some_and(|(_, side, price)| stop_hit(side, price, slice));
            let tp_hit = tp.is_some_and(|(_, side, price)| limit_hit(side, price, slice));

            let winner = match (sl_hit, tp_hit) {
                (false, false) => continue,
                (true, false) => sl,
                (false, true) => tp,
                // Both triggered in one slice: disambiguate by the open.
                // If the open is already beyond the stop, the stop is hit
                // first; beyond the target, the target is hit first; open
                // strictly between them, the stop wins (worst case).
                (true, true) => {
                    let (_, sl_side, sl_price) = sl.expect("sl_hit implies sl");
                    let (_, tp_side, tp_price) = tp.expect("tp_hit implies tp");
                    if open_beyond_stop(sl_side, sl_price, slice.open) {
                        sl
                    } else if open_beyond_limit(tp_side, tp_price, slice.open) {
                        tp
                    } else {
                        sl
                    }
                }
            };

            let (winner_id, _, winner_price) = winner.expect("winner chosen from present orders");
            let loser_id = [sl, tp]
                .into_iter()
                .flatten()
                .map(|(id, _, _)| id)
                .find(|id| *id != winner_id);

            // Sibling goes terminal atomically with the fill, before any
            // further event leaves the book.
            self.fill_and_settle_oco(
                winner_id,
                loser_id,
                winner_price,
                bar_index,
                sub_bar_index,
                ledger,
                fills,
            )?;
        }
        Ok(())
    }

    /// First active SL or TP referencing `trade_id`, in FIFO order.
    fn find_protective(
        &self,
        trade_id: TradeId,
        role: OrderRole,
    ) -> Option<(OrderId, OrderSide, f64)> {
        self.queue.iter().find_map(|id| {
            let order = self.orders.get(id)?;
            if order.is_active()
                && order.role == role
                && order.parent_trade_id == Some(trade_id)
            {
                Some((order.id, order.side, order.own_price().expect("SL/TP has price")))
            } else {
                None
            }
        })
    }

    /// Fill an entry/exit order and settle it in the ledger. Exit-role
    /// fills are capped by the open position size; the capped remainder is
    /// cancelled.
    fn fill_and_settle(
        &mut self,
        order_id: OrderId,
        price: f64,
        bar_index: usize,
        sub_bar_index: usize,
        ledger: &mut PositionLedger,
        fills: &mut Vec<Fill>,
    ) -> Result<(), BookError> {
        let order = self.orders.get(&order_id).expect("order exists");
        let mut quantity = order.remaining_quantity();
        let mut capped = false;
        if order.role == OrderRole::Exit {
            if let Some(pos) = ledger.position(&order.contract_id) {
                if quantity > pos.size {
                    quantity = pos.size;
                    capped = true;
                }
            }
        }
        if quantity <= QTY_EPSILON {
            return Ok(());
        }

        let fill = self.execute_fill(order_id, quantity, price, bar_index, sub_bar_index, capped);
        let outcome = ledger.apply_fill(&fill)?;
        self.settle_outcome(outcome);
        fills.push(fill);
        Ok(())
    }

    /// Fill an SL/TP order (capped by position size), cancelling the OCO
    /// sibling atomically.
    #[allow(clippy::too_many_arguments)]
    fn fill_and_settle_oco(
        &mut self,
        winner_id: OrderId,
        loser_id: Option<OrderId>,
        price: f64,
        bar_index: usize,
        sub_bar_index: usize,
        ledger: &mut PositionLedger,
        fills: &mut Vec<Fill>,
    ) -> Result<(), BookError> {
        let order = self.orders.get(&winner_id).expect("winner exists");
        let parent = order.parent_trade_id.expect("SL/TP carries parent");
        let position_size = ledger
            .position_by_trade_id(parent)
            .map(|p| p.size)
            .unwrap_or(0.0);
        let quantity = order.remaining_quantity().min(position_size);
        let capped = quantity + QTY_EPSILON < order.remaining_quantity();
        if quantity <= QTY_EPSILON {
            return Ok(());
        }

        let fill = self.execute_fill(winner_id, quantity, price, bar_index, sub_bar_index, capped);
        if let Some(loser) = loser_id {
            self.cancel_with_reason(loser, "OCO sibling filled");
        }
        let outcome = ledger.apply_fill(&fill)?;
        self.settle_outcome(outcome);
        fills.push(fill);
        Ok(())
    }

    /// When a fill destroyed a position, retire its remaining protective
    /// orders.
    fn settle_outcome(&mut self, outcome: LedgerOutcome) {
        match outcome {
            LedgerOutcome::Closed(trade_id)
            | LedgerOutcome::Reversed {
                closed: trade_id, ..
            } => self.cancel_all_by_trade(trade_id),
            LedgerOutcome::Opened(_) | LedgerOutcome::Added(_) | LedgerOutcome::Reduced(_) => {}
        }
    }

    /// Drop terminal orders from the pending queue (the cache keeps their
    /// full history).
    fn sweep_terminal(&mut self) {
        let orders = &self.orders;
        self.queue
            .retain(|id| orders.get(id).is_some_and(|o| o.is_active()));
    }
}

// ── Trigger predicates ───────────────────────────────────────────────

/// A stop penetrates when the slice range reaches it on the adverse side.
fn stop_hit(side: OrderSide, stop: f64, slice: &SubBar) -> bool {
    match side {
        OrderSide::Buy => slice.high >= stop,
        OrderSide::Sell => slice.low <= stop,
    }
}

/// A limit is reachable when the slice range touches it on the favorable side.
fn limit_hit(side: OrderSide, limit: f64, slice: &SubBar) -> bool {
    match side {
        OrderSide::Buy => slice.low <= limit,
        OrderSide::Sell => slice.high >= limit,
    }
}

/// Whether the slice opens at or beyond a stop's trigger level.
fn open_beyond_stop(side: OrderSide, stop: f64, open: f64) -> bool {
    match side {
        OrderSide::Buy => open >= stop,
        OrderSide::Sell => open <= stop,
    }
}

/// Whether the slice opens at or beyond a limit's price.
fn open_beyond_limit(side: OrderSide, limit: f64, open: f64) -> bool {
    match side {
        OrderSide::Buy => open <= limit,
        OrderSide::Sell => open >= limit,
    }
}
