//! Final report computed when a replay completes.

use crate::domain::{ClosedTrade, RunId};
use crate::engine::EngineConfig;
use serde::{Deserialize, Serialize};

/// Summary of a completed backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub run_id: RunId,
    pub symbol: String,
    pub timeframe: String,
    pub initial_balance: f64,
    pub final_balance: f64,
    pub final_equity: f64,
    /// `(final_equity - initial) / initial`.
    pub total_return: f64,
    pub bars_processed: usize,
    pub trade_count: usize,
    pub win_count: usize,
    pub loss_count: usize,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub total_commission: f64,
    /// Equity sampled at each bar close, aligned to bar indices.
    pub equity_curve: Vec<f64>,
    pub closed_trades: Vec<ClosedTrade>,
}

impl BacktestReport {
    pub fn compute(
        run_id: RunId,
        config: &EngineConfig,
        bars_processed: usize,
        equity_curve: Vec<f64>,
        closed_trades: Vec<ClosedTrade>,
        final_balance: f64,
        final_equity: f64,
    ) -> Self {
        let win_count = closed_trades.iter().filter(|t| t.is_winner()).count();
        let gross_profit: f64 = closed_trades
            .iter()
            .filter(|t| t.profit_or_loss > 0.0)
            .map(|t| t.profit_or_loss)
            .sum();
        let gross_loss: f64 = closed_trades
            .iter()
            .filter(|t| t.profit_or_loss < 0.0)
            .map(|t| t.profit_or_loss)
            .sum();
        let total_commission: f64 = closed_trades.iter().map(|t| t.commission).sum();

        Self {
            run_id,
            symbol: config.symbol.clone(),
            timeframe: config.timeframe.clone(),
            initial_balance: config.initial_balance,
            final_balance,
            final_equity,
            total_return: (final_equity - config.initial_balance) / config.initial_balance,
            bars_processed,
            trade_count: closed_trades.len(),
            win_count,
            loss_count: closed_trades.len() - win_count,
            gross_profit,
            gross_loss,
            total_commission,
            equity_curve,
            closed_trades,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExitReason, OrderSide, TradeId};

    fn trade(pnl: f64) -> ClosedTrade {
        ClosedTrade {
            id: TradeId(0),
            entry_time: 0,
            exit_time: 60,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            side: OrderSide::Buy,
            size: 1.0,
            commission: 0.5,
            profit_or_loss: pnl,
            exit_reason: ExitReason::Signal,
        }
    }

    #[test]
    fn aggregates_wins_and_losses() {
        let report = BacktestReport::compute(
            RunId::from_bytes(b"test"),
            &EngineConfig::default(),
            10,
            vec![100_000.0, 100_003.0],
            vec![trade(5.0), trade(-2.0), trade(0.0)],
            100_003.0,
            100_003.0,
        );
        assert_eq!(report.trade_count, 3);
        assert_eq!(report.win_count, 1);
        assert_eq!(report.loss_count, 2);
        assert_eq!(report.gross_profit, 5.0);
        assert_eq!(report.gross_loss, -2.0);
        assert!((report.total_commission - 1.5).abs() < 1e-12);
        assert!((report.total_return - 3.0e-5).abs() < 1e-12);
    }
}
