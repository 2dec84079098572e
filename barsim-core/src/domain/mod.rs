//! Domain types for the backtesting engine.

pub mod bar;
pub mod fill;
pub mod ids;
pub mod order;
pub mod position;
pub mod trade;

pub use bar::{validate_sub_bars, Bar, BarError, SubBar};
pub use fill::Fill;
pub use ids::{IdGen, OrderId, RunId, TradeId};
pub use order::{
    round_to_tick, ModifyRequest, Order, OrderDraft, OrderRole, OrderSide, OrderStatus, OrderType,
};
pub use position::Position;
pub use trade::{ClosedTrade, ExitReason};

/// Contract identifier type alias.
pub type ContractId = String;
