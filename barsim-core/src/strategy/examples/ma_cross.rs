//! Moving-average crossover: long when the fast MA crosses above the slow
//! MA, flat when it crosses back below.

use crate::domain::{Bar, OrderDraft, OrderRole, OrderSide, SubBar};
use crate::strategy::{SignalDirection, SignalEvent, Strategy, StrategyOutput};
use std::collections::HashMap;

pub struct MaCross {
    contract_id: String,
    fast: usize,
    slow: usize,
    quantity: f64,
    in_position: bool,
    prev_diff: Option<f64>,
}

impl MaCross {
    pub fn new(contract_id: impl Into<String>, fast: usize, slow: usize, quantity: f64) -> Self {
        assert!(fast < slow, "fast period must be shorter than slow period");
        Self {
            contract_id: contract_id.into(),
            fast,
            slow,
            quantity,
            in_position: false,
            prev_diff: None,
        }
    }

    fn sma(closes: &[f64], period: usize) -> Option<f64> {
        if closes.len() < period {
            return None;
        }
        Some(closes[closes.len() - period..].iter().sum::<f64>() / period as f64)
    }
}

impl Strategy for MaCross {
    fn process_bar(
        &mut self,
        bar: &Bar,
        _sub_bars: &[SubBar],
        _index: usize,
        history: &[Bar],
    ) -> StrategyOutput {
        let mut closes: Vec<f64> = history.iter().map(|b| b.close).collect();
        closes.push(bar.close);

        let (Some(fast), Some(slow)) = (
            Self::sma(&closes, self.fast),
            Self::sma(&closes, self.slow),
        ) else {
            return StrategyOutput::default();
        };

        let diff = fast - slow;
        let crossed_up = self.prev_diff.is_some_and(|p| p <= 0.0) && diff > 0.0;
        let crossed_down = self.prev_diff.is_some_and(|p| p >= 0.0) && diff < 0.0;
        self.prev_diff = Some(diff);

        let mut out = StrategyOutput {
            indicators: HashMap::from([
                (format!("sma_{}", self.fast), fast),
                (format!("sma_{}", self.slow), slow),
            ]),
            ..Default::default()
        };

        if crossed_up && !self.in_position {
            self.in_position = true;
            out.signal = Some(SignalEvent {
                strategy: self.name().to_string(),
                direction: SignalDirection::Long,
                time: bar.time,
            });
            out.orders.push(OrderDraft::market(
                self.contract_id.clone(),
                OrderSide::Buy,
                self.quantity,
            ));
        } else if crossed_down && self.in_position {
            self.in_position = false;
            out.signal = Some(SignalEvent {
                strategy: self.name().to_string(),
                direction: SignalDirection::Flat,
                time: bar.time,
            });
            out.orders.push(
                OrderDraft::market(self.contract_id.clone(), OrderSide::Sell, self.quantity)
                    .with_role(OrderRole::Exit),
            );
        }

        out
    }

    fn reset(&mut self) {
        self.in_position = false;
        self.prev_diff = None;
    }

    fn name(&self) -> &str {
        "ma_cross"
    }
}
