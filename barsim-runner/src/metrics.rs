//! Performance metrics — pure functions over equity curve and trade list.
//!
//! Every metric is a pure function: equity curve and/or closed trades in,
//! scalar out. Ratios (Sharpe, Sortino) are computed on per-bar returns and
//! are NOT annualized — the engine is timeframe-agnostic, so scale by
//! `sqrt(bars_per_year)` externally if an annual figure is needed.

use barsim_core::domain::ClosedTrade;
use serde::{Deserialize, Serialize};

/// Aggregate performance metrics for a single backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub trade_count: usize,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
}

impl PerformanceMetrics {
    pub fn compute(equity_curve: &[f64], trades: &[ClosedTrade]) -> Self {
        Self {
            total_return: total_return(equity_curve),
            sharpe: sharpe_ratio(equity_curve),
            sortino: sortino_ratio(equity_curve),
            max_drawdown: max_drawdown(equity_curve),
            win_rate: win_rate(trades),
            profit_factor: profit_factor(trades),
            expectancy: expectancy(trades),
            avg_win: avg_win(trades),
            avg_loss: avg_loss(trades),
            trade_count: trades.len(),
            max_consecutive_wins: max_consecutive(trades, true),
            max_consecutive_losses: max_consecutive(trades, false),
        }
    }
}

// ─── Equity-curve metrics ───────────────────────────────────────────

/// Total return as a fraction: (final - initial) / initial.
pub fn total_return(equity_curve: &[f64]) -> f64 {
    if equity_curve.len() < 2 {
        return 0.0;
    }
    let initial = equity_curve[0];
    if initial <= 0.0 {
        return 0.0;
    }
    (equity_curve[equity_curve.len() - 1] - initial) / initial
}

fn per_bar_returns(equity_curve: &[f64]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Per-bar Sharpe ratio: mean(returns) / std(returns). Zero when variance
/// vanishes or fewer than two returns exist.
pub fn sharpe_ratio(equity_curve: &[f64]) -> f64 {
    let returns = per_bar_returns(equity_curve);
    let std = std_dev(&returns);
    if std < 1e-15 {
        return 0.0;
    }
    mean(&returns) / std
}

/// Per-bar Sortino ratio: mean(returns) / downside deviation. Zero when no
/// downside exists.
pub fn sortino_ratio(equity_curve: &[f64]) -> f64 {
    let returns = per_bar_returns(equity_curve);
    if returns.len() < 2 {
        return 0.0;
    }
    let downside_sq: Vec<f64> = returns
        .iter()
        .filter(|&&r| r < 0.0)
        .map(|r| r * r)
        .collect();
    if downside_sq.is_empty() {
        return 0.0;
    }
    let downside = (downside_sq.iter().sum::<f64>() / downside_sq.len() as f64).sqrt();
    if downside < 1e-15 {
        return 0.0;
    }
    mean(&returns) / downside
}

/// Maximum peak-to-trough drawdown as a positive fraction.
pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for &equity in equity_curve {
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let dd = (peak - equity) / peak;
            if dd > worst {
                worst = dd;
            }
        }
    }
    worst
}

// ─── Trade-list metrics ─────────────────────────────────────────────

pub fn win_rate(trades: &[ClosedTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    trades.iter().filter(|t| t.is_winner()).count() as f64 / trades.len() as f64
}

/// Gross profit / gross loss. Infinite with wins and no losses; zero with
/// no trades.
pub fn profit_factor(trades: &[ClosedTrade]) -> f64 {
    let gross_profit: f64 = trades
        .iter()
        .filter(|t| t.profit_or_loss > 0.0)
        .map(|t| t.profit_or_loss)
        .sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.profit_or_loss < 0.0)
        .map(|t| -t.profit_or_loss)
        .sum();
    if gross_loss < 1e-15 {
        if gross_profit > 0.0 {
            return f64::INFINITY;
        }
        return 0.0;
    }
    gross_profit / gross_loss
}

/// Mean P&L per trade.
pub fn expectancy(trades: &[ClosedTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    trades.iter().map(|t| t.profit_or_loss).sum::<f64>() / trades.len() as f64
}

pub fn avg_win(trades: &[ClosedTrade]) -> f64 {
    let wins: Vec<f64> = trades
        .iter()
        .filter(|t| t.profit_or_loss > 0.0)
        .map(|t| t.profit_or_loss)
        .collect();
    mean(&wins)
}

pub fn avg_loss(trades: &[ClosedTrade]) -> f64 {
    let losses: Vec<f64> = trades
        .iter()
        .filter(|t| t.profit_or_loss < 0.0)
        .map(|t| t.profit_or_loss)
        .collect();
    mean(&losses)
}

fn max_consecutive(trades: &[ClosedTrade], winners: bool) -> usize {
    let mut best = 0usize;
    let mut run = 0usize;
    for trade in trades {
        if trade.is_winner() == winners && trade.profit_or_loss != 0.0 {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}
