//! Smoke harness — synthetic bars through the full pipeline.
//!
//! Proves the plumbing end to end: bars in → strategy signals → orders →
//! matching → ledger → cache → report. Bar generation is seeded, so a given
//! seed always reproduces the identical run.

use crate::bus::EventBus;
use crate::cache::StateCache;
use crate::domain::Bar;
use crate::engine::{BacktestReport, Engine, EngineConfig, RunOutcome};
use crate::strategy::examples::MaCross;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::rc::Rc;

/// Generate a seeded random-walk bar series that always satisfies the bar
/// range invariant.
pub fn synthetic_bars(seed: u64, count: usize, start_price: f64) -> Vec<Bar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut close = start_price;
    let mut bars = Vec::with_capacity(count);
    for i in 0..count {
        let open = close;
        let drift: f64 = rng.gen_range(-0.8..0.9);
        close = (open + drift).max(1.0);
        let wick_up: f64 = rng.gen_range(0.0..0.6);
        let wick_down: f64 = rng.gen_range(0.0..0.6);
        bars.push(Bar {
            time: 1_700_000_000 + i as i64 * 60,
            open,
            high: open.max(close) + wick_up,
            low: (open.min(close) - wick_down).max(0.5),
            close,
            volume: Some(rng.gen_range(1_000.0..50_000.0)),
        });
    }
    bars
}

/// Result of a smoke run.
#[derive(Debug)]
pub struct SmokeResult {
    pub report: BacktestReport,
    pub handler_failures: u64,
}

/// Run a moving-average-crossover backtest over synthetic bars.
pub fn run_smoke(seed: u64, bar_count: usize) -> SmokeResult {
    let config = EngineConfig::default();
    let bus = EventBus::new();
    let cache = Rc::new(RefCell::new(StateCache::new(config.initial_balance)));
    let _projection = StateCache::attach(&cache, &bus);

    let mut engine = Engine::new(config.clone(), Rc::clone(&bus), Rc::clone(&cache));
    engine
        .add_strategy(Box::new(MaCross::new(config.symbol.clone(), 5, 20, 1.0)))
        .expect("idle engine accepts strategies");
    engine
        .load_bars(synthetic_bars(seed, bar_count, 100.0))
        .expect("synthetic bars are sane");

    let outcome = engine.run().expect("smoke run completes");
    let RunOutcome::Completed(report) = outcome else {
        panic!("smoke run neither paused nor stopped");
    };

    SmokeResult {
        report: *report,
        handler_failures: bus.handler_failures(),
    }
}
