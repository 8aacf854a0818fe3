//! Simple moving average over a fixed window of closes.

use std::collections::VecDeque;

use super::{Indicator, IndicatorPhase, IndicatorValue, MAX_PERIOD, phase_for};

/// Rolling SMA with O(1) updates.
///
/// The running sum is recomputed from the window once per full rotation to
/// keep floating-point drift bounded on long-running series.
#[derive(Debug, Clone, PartialEq)]
pub struct Sma {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
    since_resum: usize,
}

impl Sma {
    /// Create a warming SMA.
    #[must_use]
    pub fn new(period: usize) -> Self {
        Self {
            period,
            window: VecDeque::with_capacity(period.min(MAX_PERIOD) + 1),
            sum: 0.0,
            since_resum: 0,
        }
    }

    /// Window length.
    #[must_use]
    pub const fn period(&self) -> usize {
        self.period
    }

    #[allow(clippy::cast_precision_loss)]
    fn mean(&self) -> Option<f64> {
        (self.window.len() == self.period).then(|| self.sum / self.period as f64)
    }
}

impl Indicator for Sma {
    fn update(&mut self, close: f64) -> Option<IndicatorValue> {
        self.window.push_back(close);
        self.sum += close;
        if self.window.len() > self.period
            && let Some(evicted) = self.window.pop_front()
        {
            self.sum -= evicted;
            self.since_resum += 1;
            if self.since_resum >= self.period {
                self.sum = self.window.iter().sum();
                self.since_resum = 0;
            }
        }
        self.value()
    }

    fn value(&self) -> Option<IndicatorValue> {
        self.mean().map(|value| IndicatorValue::Sma { value })
    }

    fn phase(&self) -> IndicatorPhase {
        phase_for(self.window.len(), self.period)
    }
}
