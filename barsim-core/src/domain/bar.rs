//! Bar and SubBar — the market data units the engine replays.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// OHLC bar at the main timeframe. Times are epoch seconds.
///
/// Immutable once published onto the bus; the engine rejects bars whose
/// range invariant does not hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

/// Finer-grained bar resolving the intra-bar price path of a parent [`Bar`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubBar {
    /// Index of the parent bar in the loaded series.
    pub parent_bar_index: usize,
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

/// Bar-level data errors.
#[derive(Debug, Error)]
pub enum BarError {
    #[error("bar at {time}: range invariant violated (open={open}, high={high}, low={low}, close={close})")]
    InvalidRange {
        time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },

    #[error("sub-bars of bar {parent_index}: {reason}")]
    SubBarMismatch { parent_index: usize, reason: String },
}

impl Bar {
    /// Range sanity check: `low <= min(open, close) <= max(open, close) <= high`.
    pub fn is_sane(&self) -> bool {
        !self.open.is_nan()
            && !self.high.is_nan()
            && !self.low.is_nan()
            && !self.close.is_nan()
            && self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
    }

    pub fn validate(&self) -> Result<(), BarError> {
        if self.is_sane() {
            Ok(())
        } else {
            Err(BarError::InvalidRange {
                time: self.time,
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            })
        }
    }
}

impl SubBar {
    /// Synthetic single sub-bar covering the whole parent bar.
    ///
    /// Used by the matcher when no sub-bar refinement is available.
    pub fn from_bar(bar: &Bar, parent_bar_index: usize) -> Self {
        Self {
            parent_bar_index,
            time: bar.time,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }

    pub fn is_sane(&self) -> bool {
        !self.open.is_nan()
            && !self.high.is_nan()
            && !self.low.is_nan()
            && !self.close.is_nan()
            && self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
    }
}

/// Validate a sub-bar series against its parent bar.
///
/// Requirements: ascending time, first open equals the parent open, last
/// close equals the parent close, and the parent's high/low bound every
/// sub-bar's high/low.
pub fn validate_sub_bars(
    parent: &Bar,
    parent_index: usize,
    subs: &[SubBar],
) -> Result<(), BarError> {
    if subs.is_empty() {
        return Ok(());
    }
    let mismatch = |reason: String| BarError::SubBarMismatch {
        parent_index,
        reason,
    };

    for pair in subs.windows(2) {
        if pair[1].time < pair[0].time {
            return Err(mismatch(format!(
                "times not ascending ({} then {})",
                pair[0].time, pair[1].time
            )));
        }
    }
    let first = &subs[0];
    let last = &subs[subs.len() - 1];
    if first.open != parent.open {
        return Err(mismatch(format!(
            "first sub-bar open {} != parent open {}",
            first.open, parent.open
        )));
    }
    if last.close != parent.close {
        return Err(mismatch(format!(
            "last sub-bar close {} != parent close {}",
            last.close, parent.close
        )));
    }
    for (i, sb) in subs.iter().enumerate() {
        if !sb.is_sane() {
            return Err(mismatch(format!("sub-bar {i} fails range invariant")));
        }
        if sb.high > parent.high || sb.low < parent.low {
            return Err(mismatch(format!(
                "sub-bar {i} range [{}, {}] escapes parent range [{}, {}]",
                sb.low, sb.high, parent.low, parent.high
            )));
        }
        if sb.parent_bar_index != parent_index {
            return Err(mismatch(format!(
                "sub-bar {i} claims parent {} but was grouped under {}",
                sb.parent_bar_index, parent_index
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bar() -> Bar {
        Bar {
            time: 1_700_000_000,
            open: 100.0,
            high: 105.0,
            low: 98.0,
            close: 103.0,
            volume: Some(50_000.0),
        }
    }

    #[test]
    fn bar_is_sane() {
        assert!(sample_bar().is_sane());
    }

    #[test]
    fn bar_detects_insane_high_low() {
        let mut bar = sample_bar();
        bar.high = 97.0; // below low
        assert!(!bar.is_sane());
        assert!(bar.validate().is_err());
    }

    #[test]
    fn bar_detects_nan() {
        let mut bar = sample_bar();
        bar.open = f64::NAN;
        assert!(!bar.is_sane());
    }

    #[test]
    fn synthetic_sub_bar_copies_parent() {
        let bar = sample_bar();
        let sb = SubBar::from_bar(&bar, 7);
        assert_eq!(sb.parent_bar_index, 7);
        assert_eq!(sb.open, bar.open);
        assert_eq!(sb.close, bar.close);
        assert!(sb.is_sane());
    }

    #[test]
    fn sub_bar_series_validates() {
        let bar = sample_bar();
        let subs = vec![
            SubBar {
                parent_bar_index: 0,
                time: bar.time,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: None,
            },
            SubBar {
                parent_bar_index: 0,
                time: bar.time + 60,
                open: 100.5,
                high: 105.0,
                low: 98.0,
                close: 103.0,
                volume: None,
            },
        ];
        assert!(validate_sub_bars(&bar, 0, &subs).is_ok());
    }

    #[test]
    fn sub_bar_series_rejects_open_mismatch() {
        let bar = sample_bar();
        let subs = vec![SubBar {
            parent_bar_index: 0,
            time: bar.time,
            open: 99.0, // parent opens at 100
            high: 105.0,
            low: 98.0,
            close: 103.0,
            volume: None,
        }];
        assert!(validate_sub_bars(&bar, 0, &subs).is_err());
    }

    #[test]
    fn sub_bar_series_rejects_range_escape() {
        let bar = sample_bar();
        let subs = vec![SubBar {
            parent_bar_index: 0,
            time: bar.time,
            open: 100.0,
            high: 106.0, // above parent high
            low: 98.0,
            close: 103.0,
            volume: None,
        }];
        assert!(validate_sub_bars(&bar, 0, &subs).is_err());
    }

    #[test]
    fn bar_serialization_roundtrip() {
        let bar = sample_bar();
        let json = serde_json::to_string(&bar).unwrap();
        let deser: Bar = serde_json::from_str(&json).unwrap();
        assert_eq!(bar, deser);
    }
}
