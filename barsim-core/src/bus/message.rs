//! Message types carried on the event bus.
//!
//! Every message is typed by a closed [`EventType`] enumeration and carries a
//! tagged [`Payload`]. Subscribers match exhaustively; there are no
//! string-typed channels.

use crate::domain::{ClosedTrade, Fill, ModifyRequest, Order, OrderDraft, OrderId, Position, RunId};
use crate::strategy::SignalEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Every event the engine publishes or consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    SubmitOrder,
    CancelOrder,
    ModifyOrder,
    OrderSubmitted,
    OrderFilled,
    OrderCancelled,
    OrderRejected,
    BarReceived,
    TickReceived,
    MarketUpdate,
    SignalGenerated,
    PositionOpened,
    PositionClosed,
    StrategyInitialized,
    StrategyStarted,
    StrategyStopped,
    StrategyDisposed,
    ProgressUpdate,
    BacktestComplete,
    /// Reply to a `request`, paired by correlation id.
    Response,
}

/// Tagged payload accompanying each event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// `SubmitOrder`: what a strategy wants executed.
    Draft(OrderDraft),
    /// `CancelOrder`.
    Cancel { order_id: OrderId },
    /// `ModifyOrder`.
    Modify(ModifyRequest),
    /// `OrderSubmitted` / `OrderCancelled` / `OrderRejected`: the order as
    /// the book now records it.
    Order(Order),
    /// `OrderFilled`.
    Fill(Fill),
    /// `BarReceived`.
    Bar {
        contract_id: String,
        timeframe: String,
        index: usize,
        bar: crate::domain::Bar,
    },
    /// `TickReceived` (live-adjacent; unused by the replay loop itself).
    Tick {
        contract_id: String,
        price: f64,
        time: i64,
    },
    /// `MarketUpdate`: per-bar equity mark after matching.
    Equity {
        bar_index: usize,
        balance: f64,
        unrealized_pnl: f64,
        equity: f64,
    },
    /// `MarketUpdate`: a strategy's indicator snapshot for the current bar.
    Indicators {
        strategy: String,
        values: HashMap<String, f64>,
    },
    /// `SignalGenerated`.
    Signal(SignalEvent),
    /// `PositionOpened`.
    Position(Position),
    /// `PositionClosed`.
    Closed(ClosedTrade),
    /// `Strategy*` lifecycle events.
    Strategy { name: String, version: String },
    /// `ProgressUpdate`.
    Progress {
        current: usize,
        total: usize,
        equity: f64,
    },
    /// `BacktestComplete`.
    Complete {
        bars_processed: usize,
        trade_count: usize,
        final_equity: f64,
        run_id: RunId,
    },
    /// Free-form payload for `request`/`Response` exchanges.
    Value(serde_json::Value),
    Empty,
}

/// A message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub event_type: EventType,
    /// Engine time (epoch seconds of the bar being processed).
    pub timestamp: i64,
    /// Component that published the message.
    pub source: String,
    /// Present on `request` messages and their `Response`.
    pub correlation_id: Option<u64>,
    pub payload: Payload,
}
