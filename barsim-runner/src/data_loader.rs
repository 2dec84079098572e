//! CSV bar and sub-bar ingestion.
//!
//! Expected bar columns: `time,open,high,low,close[,volume]`. Sub-bar files
//! carry an additional leading `parent_bar_index` column. The `time` column
//! accepts epoch seconds, RFC 3339, `YYYY-MM-DD HH:MM:SS`, or a bare date.
//! Every loaded bar must satisfy the range invariant.

use barsim_core::domain::{Bar, BarError, SubBar};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Errors from the data loading layer.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("row {row}: unparseable time '{value}'")]
    Time { row: usize, value: String },

    #[error(transparent)]
    Bar(#[from] BarError),
}

#[derive(Debug, Deserialize)]
struct BarRow {
    time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SubBarRow {
    parent_bar_index: usize,
    time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: Option<f64>,
}

/// Parse a time cell into epoch seconds.
fn parse_time(value: &str, row: usize) -> Result<i64, LoadError> {
    let value = value.trim();
    if let Ok(epoch) = value.parse::<i64>() {
        return Ok(epoch);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc().timestamp());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).expect("midnight").and_utc().timestamp());
    }
    Err(LoadError::Time {
        row,
        value: value.to_string(),
    })
}

/// Load bars from any reader producing CSV with headers.
pub fn load_bars_reader<R: Read>(reader: R) -> Result<Vec<Bar>, LoadError> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut bars = Vec::new();
    for (row, record) in csv_reader.deserialize::<BarRow>().enumerate() {
        let record = record?;
        let bar = Bar {
            time: parse_time(&record.time, row)?,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
        };
        bar.validate()?;
        bars.push(bar);
    }
    Ok(bars)
}

/// Load bars from a CSV file.
pub fn load_bars_csv(path: impl AsRef<Path>) -> Result<Vec<Bar>, LoadError> {
    load_bars_reader(std::fs::File::open(path)?)
}

/// Load sub-bars from any reader producing CSV with headers. Grouping and
/// parent-range validation happen when the engine loads them.
pub fn load_sub_bars_reader<R: Read>(reader: R) -> Result<Vec<SubBar>, LoadError> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut subs = Vec::new();
    for (row, record) in csv_reader.deserialize::<SubBarRow>().enumerate() {
        let record = record?;
        subs.push(SubBar {
            parent_bar_index: record.parent_bar_index,
            time: parse_time(&record.time, row)?,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
        });
    }
    Ok(subs)
}

/// Load sub-bars from a CSV file.
pub fn load_sub_bars_csv(path: impl AsRef<Path>) -> Result<Vec<SubBar>, LoadError> {
    load_sub_bars_reader(std::fs::File::open(path)?)
}
