//! Bollinger bands.

use std::collections::VecDeque;

use super::{Indicator, IndicatorPhase, IndicatorValue, MAX_PERIOD, phase_for};

/// SMA middle band with `±k·σ` envelopes, σ being the population standard
/// deviation of the window.
///
/// Mean and sum of squared deviations are maintained incrementally
/// (Welford while filling, sliding update once full).
#[derive(Debug, Clone, PartialEq)]
pub struct Bollinger {
    period: usize,
    multiplier: f64,
    window: VecDeque<f64>,
    mean: f64,
    m2: f64,
}

impl Bollinger {
    /// Create warming bands.
    #[must_use]
    pub fn new(period: usize, multiplier: f64) -> Self {
        Self {
            period,
            multiplier,
            window: VecDeque::with_capacity(period.min(MAX_PERIOD) + 1),
            mean: 0.0,
            m2: 0.0,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn push(&mut self, close: f64) {
        if self.window.len() < self.period {
            self.window.push_back(close);
            let delta = close - self.mean;
            self.mean += delta / self.window.len() as f64;
            self.m2 += delta * (close - self.mean);
            return;
        }

        let Some(evicted) = self.window.pop_front() else {
            return;
        };
        self.window.push_back(close);
        let old_mean = self.mean;
        self.mean += (close - evicted) / self.period as f64;
        self.m2 += (close - evicted) * (close - self.mean + evicted - old_mean);
        // Rounding can push this marginally below zero on flat windows.
        self.m2 = self.m2.max(0.0);
    }
}

impl Indicator for Bollinger {
    fn update(&mut self, close: f64) -> Option<IndicatorValue> {
        self.push(close);
        self.value()
    }

    #[allow(clippy::cast_precision_loss)]
    fn value(&self) -> Option<IndicatorValue> {
        if self.window.len() < self.period {
            return None;
        }
        let variance = (self.m2 / self.period as f64).max(0.0);
        let width = self.multiplier * variance.sqrt();
        Some(IndicatorValue::Bollinger {
            middle: self.mean,
            upper: self.mean + width,
            lower: self.mean - width,
        })
    }

    fn phase(&self) -> IndicatorPhase {
        phase_for(self.window.len(), self.period)
    }
}
