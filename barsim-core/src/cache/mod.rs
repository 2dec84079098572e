//! State cache — the bus-fed projection of everything the run produced.
//!
//! The cache subscribes to the wildcard topic and folds every message into
//! queryable structures: bars by `(contract, timeframe)`, orders by id and
//! by status, open and closed positions, per-strategy indicator and signal
//! state, and the equity curve. It publishes nothing; it is a projection,
//! not a source.

use crate::bus::{EventBus, EventType, Message, Payload, Subscription, Topic};
use crate::domain::{Bar, ClosedTrade, ContractId, Order, OrderId, OrderStatus, Position};
use crate::strategy::SignalEvent;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

/// Per-strategy projection: last indicator snapshot plus every signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyState {
    pub indicators: HashMap<String, f64>,
    pub signals: Vec<SignalEvent>,
}

/// Serializable snapshot of the whole cache, in canonical key order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub bars: BTreeMap<String, Vec<Bar>>,
    pub orders: BTreeMap<u64, Order>,
    pub orders_by_status: Vec<(OrderStatus, Vec<OrderId>)>,
    pub open_positions: BTreeMap<ContractId, Position>,
    pub closed_trades: Vec<ClosedTrade>,
    pub strategies: BTreeMap<String, StrategyState>,
    pub equity_curve: Vec<f64>,
    pub balance: f64,
    pub unrealized_pnl: f64,
}

/// The authoritative projection of orders, positions, bars and equity.
pub struct StateCache {
    initial_balance: f64,
    bars: HashMap<String, Vec<Bar>>,
    orders: HashMap<OrderId, Order>,
    orders_by_status: HashMap<OrderStatus, BTreeSet<OrderId>>,
    open_positions: HashMap<ContractId, Position>,
    closed_trades: Vec<ClosedTrade>,
    strategies: HashMap<String, StrategyState>,
    equity_curve: Vec<f64>,
    balance: f64,
    unrealized_pnl: f64,
}

impl StateCache {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            bars: HashMap::new(),
            orders: HashMap::new(),
            orders_by_status: HashMap::new(),
            open_positions: HashMap::new(),
            closed_trades: Vec::new(),
            strategies: HashMap::new(),
            equity_curve: Vec::new(),
            balance: initial_balance,
            unrealized_pnl: 0.0,
        }
    }

    /// Wire a cache to the bus. Keep the returned subscription alive for as
    /// long as the cache should receive updates.
    pub fn attach(cache: &Rc<RefCell<StateCache>>, bus: &Rc<EventBus>) -> Subscription {
        let projected = Rc::clone(cache);
        bus.subscribe(Topic::All, move |msg| {
            projected.borrow_mut().apply(msg);
            Ok(())
        })
    }

    /// Key for the bar store.
    pub fn bar_key(contract_id: &str, timeframe: &str) -> String {
        format!("{contract_id}:{timeframe}")
    }

    // ── Projection ─────────────────────────────────────────────────────

    /// Fold one message into the projection.
    pub fn apply(&mut self, msg: &Message) {
        match (&msg.event_type, &msg.payload) {
            (
                EventType::BarReceived,
                Payload::Bar {
                    contract_id,
                    timeframe,
                    bar,
                    ..
                },
            ) => {
                self.bars
                    .entry(Self::bar_key(contract_id, timeframe))
                    .or_default()
                    .push(bar.clone());
            }

            (
                EventType::OrderSubmitted
                | EventType::OrderCancelled
                | EventType::OrderRejected,
                Payload::Order(order),
            ) => {
                self.upsert_order(order.clone());
            }

            (EventType::OrderFilled, Payload::Fill(fill)) => {
                if let Some(mut order) = self.orders.get(&fill.order_id).cloned() {
                    if order.is_active() {
                        let prior = order.filled_price.unwrap_or(0.0) * order.filled_quantity;
                        order.filled_quantity += fill.quantity;
                        order.filled_price =
                            Some((prior + fill.price * fill.quantity) / order.filled_quantity);
                        order.filled_time = Some(fill.time);
                        order.status = if order.remaining_quantity() <= 1e-9 {
                            OrderStatus::Filled
                        } else {
                            OrderStatus::PartiallyFilled
                        };
                        self.upsert_order(order);
                    }
                }
            }

            (EventType::PositionOpened, Payload::Position(pos))
            | (EventType::MarketUpdate, Payload::Position(pos)) => {
                self.open_positions
                    .insert(pos.contract_id.clone(), pos.clone());
            }

            (EventType::PositionClosed, Payload::Closed(trade)) => {
                self.open_positions.retain(|_, p| p.id != trade.id);
                self.closed_trades.push(trade.clone());
            }

            (
                EventType::MarketUpdate,
                Payload::Equity {
                    balance,
                    unrealized_pnl,
                    equity,
                    ..
                },
            ) => {
                self.balance = *balance;
                self.unrealized_pnl = *unrealized_pnl;
                self.equity_curve.push(*equity);
            }

            (EventType::MarketUpdate, Payload::Indicators { strategy, values }) => {
                self.strategies
                    .entry(strategy.clone())
                    .or_default()
                    .indicators = values.clone();
            }

            (EventType::SignalGenerated, Payload::Signal(signal)) => {
                self.strategies
                    .entry(signal.strategy.clone())
                    .or_default()
                    .signals
                    .push(signal.clone());
            }

            (EventType::StrategyInitialized, Payload::Strategy { name, .. }) => {
                self.strategies.entry(name.clone()).or_default();
            }

            // Commands, ticks, lifecycle chatter and responses leave no
            // trace in the projection.
            _ => {}
        }
    }

    fn upsert_order(&mut self, order: Order) {
        if let Some(old) = self.orders.get(&order.id) {
            if let Some(set) = self.orders_by_status.get_mut(&old.status) {
                set.remove(&order.id);
            }
        }
        self.orders_by_status
            .entry(order.status)
            .or_default()
            .insert(order.id);
        self.orders.insert(order.id, order);
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn bars(&self, contract_id: &str, timeframe: &str) -> &[Bar] {
        self.bars
            .get(&Self::bar_key(contract_id, timeframe))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn orders_with_status(&self, status: OrderStatus) -> Vec<&Order> {
        self.orders_by_status
            .get(&status)
            .into_iter()
            .flatten()
            .filter_map(|id| self.orders.get(id))
            .collect()
    }

    pub fn open_position(&self, contract_id: &str) -> Option<&Position> {
        self.open_positions.get(contract_id)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.open_positions.values()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }

    pub fn strategy_state(&self, name: &str) -> Option<&StrategyState> {
        self.strategies.get(name)
    }

    pub fn indicator(&self, strategy: &str, name: &str) -> Option<f64> {
        self.strategies
            .get(strategy)
            .and_then(|s| s.indicators.get(name))
            .copied()
    }

    pub fn equity_curve(&self) -> &[f64] {
        &self.equity_curve
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.unrealized_pnl
    }

    pub fn equity(&self) -> f64 {
        self.balance + self.unrealized_pnl
    }

    // ── Snapshot & reset ───────────────────────────────────────────────

    pub fn snapshot(&self) -> CacheSnapshot {
        let mut orders_by_status: Vec<(OrderStatus, Vec<OrderId>)> = self
            .orders_by_status
            .iter()
            .map(|(status, ids)| (*status, ids.iter().copied().collect()))
            .collect();
        orders_by_status.sort_by_key(|(status, _)| format!("{status:?}"));

        CacheSnapshot {
            bars: self
                .bars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            orders: self.orders.iter().map(|(k, v)| (k.0, v.clone())).collect(),
            orders_by_status,
            open_positions: self
                .open_positions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            closed_trades: self.closed_trades.clone(),
            strategies: self
                .strategies
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            equity_curve: self.equity_curve.clone(),
            balance: self.balance,
            unrealized_pnl: self.unrealized_pnl,
        }
    }

    /// Restore the initial balance and clear every collection. Idempotent.
    pub fn reset(&mut self) {
        self.bars.clear();
        self.orders.clear();
        self.orders_by_status.clear();
        self.open_positions.clear();
        self.closed_trades.clear();
        self.strategies.clear();
        self.equity_curve.clear();
        self.balance = self.initial_balance;
        self.unrealized_pnl = 0.0;
    }
}
