//! barsim-runner — orchestration around the core engine.
//!
//! CSV bar ingestion, a one-call [`runner::run_backtest`] entry point,
//! performance metrics over the finished run, and versioned JSON/CSV export.

pub mod data_loader;
pub mod export;
pub mod metrics;
pub mod runner;

pub use data_loader::{load_bars_csv, load_bars_reader, load_sub_bars_csv, load_sub_bars_reader};
pub use export::{export_equity_csv, export_json, export_trades_csv, import_json};
pub use metrics::PerformanceMetrics;
pub use runner::{run_backtest, BacktestResult, SCHEMA_VERSION};
