//! Result export — JSON round-trip with schema guard, plus CSV tapes.

use anyhow::{bail, Context, Result};
use barsim_core::domain::ClosedTrade;

use crate::runner::{BacktestResult, SCHEMA_VERSION};

// ─── JSON export ────────────────────────────────────────────────────

/// Serialize a result to pretty JSON.
pub fn export_json(result: &BacktestResult) -> Result<String> {
    serde_json::to_string_pretty(result).context("failed to serialize BacktestResult to JSON")
}

/// Deserialize a result from JSON, rejecting unknown schema versions.
pub fn import_json(json: &str) -> Result<BacktestResult> {
    let result: BacktestResult =
        serde_json::from_str(json).context("failed to deserialize BacktestResult from JSON")?;
    if result.schema_version > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            result.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(result)
}

// ─── CSV export ─────────────────────────────────────────────────────

/// Export the trade tape as CSV.
///
/// Columns: id, side, entry_time, entry_price, exit_time, exit_price, size,
/// commission, profit_or_loss, exit_reason.
pub fn export_trades_csv(trades: &[ClosedTrade]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record([
        "id",
        "side",
        "entry_time",
        "entry_price",
        "exit_time",
        "exit_price",
        "size",
        "commission",
        "profit_or_loss",
        "exit_reason",
    ])?;
    for trade in trades {
        writer.write_record([
            trade.id.0.to_string(),
            format!("{:?}", trade.side),
            trade.entry_time.to_string(),
            format!("{:.6}", trade.entry_price),
            trade.exit_time.to_string(),
            format!("{:.6}", trade.exit_price),
            format!("{:.4}", trade.size),
            format!("{:.4}", trade.commission),
            format!("{:.6}", trade.profit_or_loss),
            format!("{:?}", trade.exit_reason),
        ])?;
    }
    let bytes = writer.into_inner().context("csv writer flush")?;
    String::from_utf8(bytes).context("csv output is utf-8")
}

/// Export the equity curve as CSV (`bar_index,equity`).
pub fn export_equity_csv(equity_curve: &[f64]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record(["bar_index", "equity"])?;
    for (index, equity) in equity_curve.iter().enumerate() {
        writer.write_record([index.to_string(), format!("{equity:.6}")])?;
    }
    let bytes = writer.into_inner().context("csv writer flush")?;
    String::from_utf8(bytes).context("csv output is utf-8")
}
