//! Exponential moving average seeded with the SMA of the first `n` closes.

use super::{Indicator, IndicatorPhase, IndicatorValue, phase_for};

/// Rolling EMA with `α = 2 / (n + 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Ema {
    period: usize,
    alpha: f64,
    seed_sum: f64,
    observed: usize,
    current: Option<f64>,
}

impl Ema {
    /// Create a warming EMA.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(period: usize) -> Self {
        Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            seed_sum: 0.0,
            observed: 0,
            current: None,
        }
    }

    /// Feed one input and return the raw EMA once seeded.
    ///
    /// Shared with MACD, which smooths both closes and the MACD line.
    #[allow(clippy::cast_precision_loss)]
    pub fn next(&mut self, input: f64) -> Option<f64> {
        self.observed = self.observed.saturating_add(1);
        self.current = match self.current {
            Some(prev) => Some(input.mul_add(self.alpha, prev * (1.0 - self.alpha))),
            None => {
                self.seed_sum += input;
                (self.observed == self.period).then(|| self.seed_sum / self.period as f64)
            }
        };
        self.current
    }

    /// Latest EMA, if seeded.
    #[must_use]
    pub const fn current(&self) -> Option<f64> {
        self.current
    }
}

impl Indicator for Ema {
    fn update(&mut self, close: f64) -> Option<IndicatorValue> {
        self.next(close).map(|value| IndicatorValue::Ema { value })
    }

    fn value(&self) -> Option<IndicatorValue> {
        self.current.map(|value| IndicatorValue::Ema { value })
    }

    fn phase(&self) -> IndicatorPhase {
        phase_for(self.observed, self.period)
    }
}
