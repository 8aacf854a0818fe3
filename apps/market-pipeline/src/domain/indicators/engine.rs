//! Indicator Engine
//!
//! Owns one [`IndicatorState`] per `(series, indicator kind)` regardless of
//! how many subscribers want it, and updates each exactly once per closed bar.

use std::collections::HashMap;

use super::{Indicator, IndicatorKind, IndicatorOutput, IndicatorState};
use crate::domain::market::{Bar, SeriesKey};

/// Per-series indicator states, kept in registration order.
#[derive(Debug, Default)]
pub struct IndicatorEngine {
    series: HashMap<SeriesKey, Vec<(IndicatorKind, IndicatorState)>>,
    computations: u64,
}

impl IndicatorEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start computing `kind` for `key`, replaying `history` (oldest first)
    /// so the state matches what live processing of those bars would have
    /// produced.
    ///
    /// Returns `false` without touching existing state if already registered.
    pub fn register(&mut self, key: &SeriesKey, kind: IndicatorKind, history: &[Bar]) -> bool {
        let states = self.series.entry(key.clone()).or_default();
        if states.iter().any(|(k, _)| *k == kind) {
            return false;
        }
        let closes = history.iter().filter(|b| b.closed).map(Bar::close_f64);
        states.push((kind, IndicatorState::replay(kind, closes)));
        true
    }

    /// Stop computing `kind` for `key`. Returns whether it was registered.
    pub fn unregister(&mut self, key: &SeriesKey, kind: IndicatorKind) -> bool {
        let Some(states) = self.series.get_mut(key) else {
            return false;
        };
        let before = states.len();
        states.retain(|(k, _)| *k != kind);
        let removed = states.len() != before;
        if states.is_empty() {
            self.series.remove(key);
        }
        removed
    }

    /// Drop every indicator for `key`. Returns how many were removed.
    pub fn remove_series(&mut self, key: &SeriesKey) -> usize {
        self.series.remove(key).map_or(0, |states| states.len())
    }

    /// Whether `kind` is computed for `key`.
    #[must_use]
    pub fn is_registered(&self, key: &SeriesKey, kind: IndicatorKind) -> bool {
        self.series
            .get(key)
            .is_some_and(|states| states.iter().any(|(k, _)| *k == kind))
    }

    /// Indicator kinds computed for `key`.
    #[must_use]
    pub fn kinds(&self, key: &SeriesKey) -> Vec<IndicatorKind> {
        self.series
            .get(key)
            .map(|states| states.iter().map(|(k, _)| *k).collect())
            .unwrap_or_default()
    }

    /// Current state of one indicator.
    #[must_use]
    pub fn state(&self, key: &SeriesKey, kind: IndicatorKind) -> Option<&IndicatorState> {
        self.series
            .get(key)?
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, s)| s)
    }

    /// Latest output of every indicator on `key`, stamped with `bar`'s end.
    #[must_use]
    pub fn snapshot_outputs(&self, key: &SeriesKey, bar: Option<&Bar>) -> Vec<IndicatorOutput> {
        let Some(states) = self.series.get(key) else {
            return Vec::new();
        };
        let time = bar.map(|b| b.end_time).unwrap_or_default();
        states
            .iter()
            .map(|(kind, state)| IndicatorOutput {
                indicator: *kind,
                time,
                phase: state.phase(),
                value: state.value(),
            })
            .collect()
    }

    /// Update every indicator on the bar's series.
    ///
    /// Open bars are ignored; indicators only ever see closed bars.
    pub fn on_bar_closed(&mut self, bar: &Bar) -> Vec<IndicatorOutput> {
        if !bar.closed {
            return Vec::new();
        }
        let Some(states) = self.series.get_mut(&bar.key()) else {
            return Vec::new();
        };
        let close = bar.close_f64();
        let mut outputs = Vec::with_capacity(states.len());
        for (kind, state) in states.iter_mut() {
            let value = state.update(close);
            self.computations += 1;
            outputs.push(IndicatorOutput {
                indicator: *kind,
                time: bar.end_time,
                phase: state.phase(),
                value,
            });
        }
        outputs
    }

    /// Rebuild every indicator on `key` from `history` (hard resync).
    ///
    /// Returns how many indicators were rebuilt.
    pub fn rebuild(&mut self, key: &SeriesKey, history: &[Bar]) -> usize {
        let Some(states) = self.series.get_mut(key) else {
            return 0;
        };
        for (kind, state) in states.iter_mut() {
            let closes = history.iter().filter(|b| b.closed).map(Bar::close_f64);
            *state = IndicatorState::replay(*kind, closes);
        }
        states.len()
    }

    /// Number of per-bar indicator updates performed so far.
    #[must_use]
    pub const fn computation_count(&self) -> u64 {
        self.computations
    }

    /// Number of series with at least one indicator.
    #[must_use]
    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::indicators::{IndicatorPhase, IndicatorValue};
    use crate::domain::market::{Timeframe, millis_to_utc};

    fn bar(i: i64, close: i64) -> Bar {
        let start = i * 60_000;
        Bar {
            symbol: "BTC-USD".to_string(),
            timeframe: Timeframe::MINUTE,
            start_time: millis_to_utc(start),
            end_time: millis_to_utc(start + 60_000),
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: Decimal::ONE,
            tick_count: 1,
            closed: true,
            synthesized: false,
        }
    }

    fn key() -> SeriesKey {
        SeriesKey::new("BTC-USD", Timeframe::MINUTE)
    }

    #[test]
    fn computes_once_per_kind_per_bar() {
        let mut engine = IndicatorEngine::new();
        let sma = IndicatorKind::Sma { period: 3 };
        assert!(engine.register(&key(), sma, &[]));
        assert!(!engine.register(&key(), sma, &[]));
        engine.register(&key(), IndicatorKind::Rsi { period: 2 }, &[]);

        for i in 0..10 {
            let outputs = engine.on_bar_closed(&bar(i, 100 + i));
            assert_eq!(outputs.len(), 2);
        }
        assert_eq!(engine.computation_count(), 20);
    }

    #[test]
    fn open_bars_are_ignored() {
        let mut engine = IndicatorEngine::new();
        engine.register(&key(), IndicatorKind::Sma { period: 1 }, &[]);
        let mut open = bar(0, 100);
        open.closed = false;
        assert!(engine.on_bar_closed(&open).is_empty());
        assert_eq!(engine.computation_count(), 0);
    }

    #[test]
    fn warming_outputs_have_no_value() {
        let mut engine = IndicatorEngine::new();
        engine.register(&key(), IndicatorKind::Sma { period: 3 }, &[]);
        let outputs = engine.on_bar_closed(&bar(0, 100));
        assert_eq!(
            outputs[0].phase,
            IndicatorPhase::Warming {
                observed: 1,
                required: 3
            }
        );
        assert!(outputs[0].value.is_none());
        assert_eq!(outputs[0].time, millis_to_utc(60_000));
    }

    #[test]
    fn replay_matches_live_processing() {
        let bars: Vec<Bar> = (0..40).map(|i| bar(i, 100 + (i * 7) % 11)).collect();
        let kind = IndicatorKind::macd();

        let mut live = IndicatorEngine::new();
        live.register(&key(), kind, &[]);
        for b in &bars {
            live.on_bar_closed(b);
        }

        let mut replayed = IndicatorEngine::new();
        replayed.register(&key(), kind, &bars[..30]);
        for b in &bars[30..] {
            replayed.on_bar_closed(b);
        }

        assert_eq!(live.state(&key(), kind), replayed.state(&key(), kind));
    }

    #[test]
    fn unregister_drops_empty_series() {
        let mut engine = IndicatorEngine::new();
        let kind = IndicatorKind::Ema { period: 5 };
        engine.register(&key(), kind, &[]);
        assert_eq!(engine.series_count(), 1);
        assert!(engine.unregister(&key(), kind));
        assert!(!engine.unregister(&key(), kind));
        assert_eq!(engine.series_count(), 0);
    }

    #[test]
    fn rebuild_replaces_state() {
        let mut engine = IndicatorEngine::new();
        let kind = IndicatorKind::Sma { period: 2 };
        engine.register(&key(), kind, &[]);
        engine.on_bar_closed(&bar(0, 1));
        engine.on_bar_closed(&bar(1, 3));

        let history = [bar(0, 10), bar(1, 20)];
        assert_eq!(engine.rebuild(&key(), &history), 1);
        assert_eq!(
            engine.state(&key(), kind).and_then(Indicator::value),
            Some(IndicatorValue::Sma { value: 15.0 })
        );
    }
}
