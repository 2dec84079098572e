//! One-call backtest orchestration.
//!
//! Wires bus, cache and engine together, runs the replay to completion, and
//! packages the engine report with performance metrics into a versioned,
//! serializable result.

use crate::metrics::PerformanceMetrics;
use anyhow::{bail, Result};
use barsim_core::bus::EventBus;
use barsim_core::cache::StateCache;
use barsim_core::domain::{Bar, SubBar};
use barsim_core::engine::{BacktestReport, Engine, EngineConfig, RunOutcome};
use barsim_core::strategy::Strategy;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

/// Bumped whenever the serialized result layout changes.
pub const SCHEMA_VERSION: u32 = 1;

/// A complete, exportable backtest result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub schema_version: u32,
    /// RFC 3339 timestamp of when the result was produced.
    pub generated_at: String,
    pub report: BacktestReport,
    pub metrics: PerformanceMetrics,
}

/// Run a backtest to completion and compute metrics.
pub fn run_backtest(
    config: EngineConfig,
    bars: Vec<Bar>,
    sub_bars: Vec<SubBar>,
    strategies: Vec<Box<dyn Strategy>>,
) -> Result<BacktestResult> {
    let bus = EventBus::new();
    let cache = Rc::new(RefCell::new(StateCache::new(config.initial_balance)));
    let _projection = StateCache::attach(&cache, &bus);

    let mut engine = Engine::new(config, bus, cache);
    for strategy in strategies {
        engine.add_strategy(strategy)?;
    }
    engine.load_bars(bars)?;
    if !sub_bars.is_empty() {
        engine.load_sub_bars(sub_bars)?;
    }

    let report = match engine.run()? {
        RunOutcome::Completed(report) => *report,
        RunOutcome::Paused | RunOutcome::Stopped => {
            bail!("backtest did not run to completion")
        }
    };

    let metrics = PerformanceMetrics::compute(&report.equity_curve, &report.closed_trades);
    Ok(BacktestResult {
        schema_version: SCHEMA_VERSION,
        generated_at: chrono::Utc::now().to_rfc3339(),
        report,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use barsim_core::smoke::synthetic_bars;
    use barsim_core::strategy::examples::MaCross;

    #[test]
    fn runs_to_completion_with_metrics() {
        let config = EngineConfig::default();
        let result = run_backtest(
            config.clone(),
            synthetic_bars(9, 400, 100.0),
            Vec::new(),
            vec![Box::new(MaCross::new(config.symbol.clone(), 5, 20, 1.0))],
        )
        .unwrap();

        assert_eq!(result.schema_version, SCHEMA_VERSION);
        assert_eq!(result.report.bars_processed, 400);
        assert_eq!(result.report.equity_curve.len(), 400);
        assert_eq!(result.metrics.trade_count, result.report.trade_count);
        assert!((result.metrics.total_return - result.report.total_return).abs() < 1e-12);
    }

    #[test]
    fn fails_without_strategies() {
        let err = run_backtest(
            EngineConfig::default(),
            synthetic_bars(9, 10, 100.0),
            Vec::new(),
            Vec::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no strategies"));
    }
}
