//! Strategy contract — the only surface a trading strategy sees.
//!
//! Strategies receive bars, return signals and indicator snapshots, and ask
//! for orders either by listing drafts in their output or by publishing
//! `SubmitOrder` messages on the bus. They hold no references into the
//! engine.

pub mod examples;

use crate::domain::{Bar, OrderDraft, SubBar};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Direction of a generated signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalDirection {
    Long,
    Short,
    Flat,
}

/// A strategy's trading signal for one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub strategy: String,
    pub direction: SignalDirection,
    pub time: i64,
}

/// Everything a strategy hands back for one bar.
#[derive(Debug, Clone, Default)]
pub struct StrategyOutput {
    pub signal: Option<SignalEvent>,
    /// Indicator name → current value; snapshotted by the cache each bar.
    pub indicators: HashMap<String, f64>,
    /// Orders to submit, routed onto the bus by the engine.
    pub orders: Vec<OrderDraft>,
}

/// A pluggable trading strategy.
pub trait Strategy {
    /// Process one bar. `history` contains all bars strictly before `index`.
    fn process_bar(
        &mut self,
        bar: &Bar,
        sub_bars: &[SubBar],
        index: usize,
        history: &[Bar],
    ) -> StrategyOutput;

    /// Drop all accumulated state, ready for a fresh run.
    fn reset(&mut self);

    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }
}
