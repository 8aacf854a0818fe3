//! Wilder's relative strength index.

use super::{Indicator, IndicatorPhase, IndicatorValue, phase_for};

/// Rolling RSI using Wilder smoothing of average gain and loss.
///
/// The first `n` close-to-close changes seed the averages with a plain mean.
/// When the average loss is zero the value is 100, or 50 if there was no
/// movement at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Rsi {
    period: usize,
    prev_close: Option<f64>,
    closes_seen: usize,
    seed_gain: f64,
    seed_loss: f64,
    seed_count: usize,
    averages: Option<(f64, f64)>,
}

impl Rsi {
    /// Create a warming RSI.
    #[must_use]
    pub const fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            closes_seen: 0,
            seed_gain: 0.0,
            seed_loss: 0.0,
            seed_count: 0,
            averages: None,
        }
    }

    fn from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
        if avg_loss == 0.0 {
            return if avg_gain == 0.0 { 50.0 } else { 100.0 };
        }
        let rs = avg_gain / avg_loss;
        (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
    }
}

impl Indicator for Rsi {
    #[allow(clippy::cast_precision_loss)]
    fn update(&mut self, close: f64) -> Option<IndicatorValue> {
        self.closes_seen = self.closes_seen.saturating_add(1);
        let prev = self.prev_close.replace(close)?;

        let change = close - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        let n = self.period as f64;

        self.averages = match self.averages {
            Some((avg_gain, avg_loss)) => Some((
                avg_gain.mul_add(n - 1.0, gain) / n,
                avg_loss.mul_add(n - 1.0, loss) / n,
            )),
            None => {
                self.seed_gain += gain;
                self.seed_loss += loss;
                self.seed_count += 1;
                (self.seed_count == self.period)
                    .then(|| (self.seed_gain / n, self.seed_loss / n))
            }
        };
        self.value()
    }

    fn value(&self) -> Option<IndicatorValue> {
        self.averages.map(|(g, l)| IndicatorValue::Rsi {
            value: Self::from_averages(g, l),
        })
    }

    fn phase(&self) -> IndicatorPhase {
        phase_for(self.closes_seen, self.period.saturating_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsi_after(period: usize, closes: &[f64]) -> Option<f64> {
        let mut rsi = Rsi::new(period);
        let mut last = None;
        for close in closes {
            last = rsi.update(*close);
        }
        last.map(|v| match v {
            IndicatorValue::Rsi { value } => value,
            other => panic!("expected rsi, got {other:?}"),
        })
    }

    #[test]
    fn needs_period_plus_one_closes() {
        assert!(rsi_after(3, &[1.0, 2.0, 3.0]).is_none());
        assert!(rsi_after(3, &[1.0, 2.0, 3.0, 4.0]).is_some());
    }

    #[test]
    fn monotonic_rise_is_100() {
        let closes: Vec<f64> = (0..20).map(f64::from).collect();
        assert!((rsi_after(14, &closes).unwrap() - 100.0).abs() < 1e-12);
    }

    #[test]
    fn monotonic_fall_is_0() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 - f64::from(i)).collect();
        assert!(rsi_after(14, &closes).unwrap().abs() < 1e-12);
    }

    #[test]
    fn flat_series_is_50() {
        let closes = [10.0; 20];
        assert!((rsi_after(14, &closes).unwrap() - 50.0).abs() < 1e-12);
    }

    #[test]
    fn alternating_is_balanced() {
        let closes: Vec<f64> = (0..15)
            .map(|i| if i % 2 == 0 { 10.0 } else { 11.0 })
            .collect();
        // 14 changes: 7 gains and 7 losses of 1.0 each.
        assert!((rsi_after(14, &closes).unwrap() - 50.0).abs() < 1e-9);
    }
}
