//! Moving average convergence/divergence.

use super::{Indicator, IndicatorPhase, IndicatorValue, phase_for, Ema};

/// MACD line (`EMA_fast - EMA_slow`), its signal EMA, and the histogram.
///
/// The signal EMA only starts receiving input once the slow EMA is seeded,
/// so it is itself seeded from the SMA of the first `signal` MACD values.
#[derive(Debug, Clone, PartialEq)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
    required: usize,
    observed: usize,
    latest: Option<IndicatorValue>,
}

impl Macd {
    /// Create a warming MACD.
    #[must_use]
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: Ema::new(fast),
            slow: Ema::new(slow),
            signal: Ema::new(signal),
            required: slow.saturating_add(signal).saturating_sub(1),
            observed: 0,
            latest: None,
        }
    }
}

impl Indicator for Macd {
    fn update(&mut self, close: f64) -> Option<IndicatorValue> {
        self.observed = self.observed.saturating_add(1);
        let fast = self.fast.next(close);
        let slow = self.slow.next(close);
        let (Some(fast), Some(slow)) = (fast, slow) else {
            return None;
        };

        let macd = fast - slow;
        let signal = self.signal.next(macd)?;
        self.latest = Some(IndicatorValue::Macd {
            macd,
            signal,
            histogram: macd - signal,
        });
        self.latest
    }

    fn value(&self) -> Option<IndicatorValue> {
        self.latest
    }

    fn phase(&self) -> IndicatorPhase {
        phase_for(self.observed, self.required)
    }
}
