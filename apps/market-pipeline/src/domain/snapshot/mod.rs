//! Snapshot Cache
//!
//! Bounded ring buffer of the most recent closed bars and latest indicator
//! values per series. Seeds newly created indicator state and answers a new
//! subscriber's initial snapshot before it switches to the live stream.
//!
//! Recorded bars are always a suffix of the true bar history: a bar is only
//! accepted if it ends after the newest one already held.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::indicators::{IndicatorKind, IndicatorOutput};
use super::market::{Bar, SeriesKey, Symbol, Timeframe};

/// Default number of closed bars kept per series.
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 500;

/// Point-in-time view of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Bucket length.
    pub timeframe: Timeframe,
    /// Closed bars, oldest first.
    pub bars: Vec<Bar>,
    /// Latest value of each indicator.
    pub indicators: Vec<IndicatorOutput>,
    /// Bar currently being built, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_bar: Option<Bar>,
}

impl Snapshot {
    /// Empty snapshot for a series.
    #[must_use]
    pub fn empty(key: &SeriesKey) -> Self {
        Self {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            bars: Vec::new(),
            indicators: Vec::new(),
            open_bar: None,
        }
    }

    /// Keep only the given indicators.
    pub fn retain_indicators(&mut self, kinds: &[IndicatorKind]) {
        self.indicators.retain(|o| kinds.contains(&o.indicator));
    }
}

/// Historical bars rejected by [`SnapshotCache::seed`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeedError {
    /// A bar belongs to another series.
    #[error("bar {index} belongs to {found}, expected {expected}")]
    Mismatched {
        /// Position in the input.
        index: usize,
        /// Series being seeded.
        expected: SeriesKey,
        /// Series of the bar.
        found: SeriesKey,
    },
    /// A bar is not closed.
    #[error("bar {index} is still open")]
    Open {
        /// Position in the input.
        index: usize,
    },
    /// A bar's bounds do not match a bucket of the series timeframe.
    #[error("bar {index} is not aligned to the timeframe")]
    Misaligned {
        /// Position in the input.
        index: usize,
    },
    /// A bar starts before the previous one ends.
    #[error("bar {index} overlaps or precedes the previous bar")]
    Unordered {
        /// Position in the input.
        index: usize,
    },
}

#[derive(Debug, Default)]
struct SnapshotEntry {
    bars: VecDeque<Bar>,
    indicators: Vec<IndicatorOutput>,
}

/// Ring buffers of recent bars keyed by series.
#[derive(Debug)]
pub struct SnapshotCache {
    capacity: usize,
    entries: HashMap<SeriesKey, SnapshotEntry>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_CAPACITY)
    }
}

impl SnapshotCache {
    /// Create a cache holding up to `capacity` bars per series.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    /// Bars kept per series.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a closed bar and the indicator values it produced.
    ///
    /// Open bars and bars that do not extend the held history are ignored.
    /// Returns whether the bar was stored.
    pub fn record(&mut self, bar: &Bar, outputs: &[IndicatorOutput]) -> bool {
        if !bar.closed {
            return false;
        }
        let entry = self.entries.entry(bar.key()).or_default();
        if entry
            .bars
            .back()
            .is_some_and(|last| bar.end_time <= last.end_time)
        {
            return false;
        }
        entry.bars.push_back(bar.clone());
        while entry.bars.len() > self.capacity {
            entry.bars.pop_front();
        }
        merge_outputs(&mut entry.indicators, outputs);
        true
    }

    /// Replace the latest indicator values for a series without adding a bar.
    pub fn set_indicators(&mut self, key: &SeriesKey, outputs: &[IndicatorOutput]) {
        if let Some(entry) = self.entries.get_mut(key) {
            merge_outputs(&mut entry.indicators, outputs);
        } else if !outputs.is_empty() {
            let entry = self.entries.entry(key.clone()).or_default();
            merge_outputs(&mut entry.indicators, outputs);
        }
    }

    /// Forget the latest value of one indicator.
    pub fn drop_indicator(&mut self, key: &SeriesKey, kind: IndicatorKind) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.indicators.retain(|o| o.indicator != kind);
        }
    }

    /// Current snapshot for a series; empty if nothing is held.
    #[must_use]
    pub fn get_snapshot(&self, key: &SeriesKey) -> Snapshot {
        let mut snapshot = Snapshot::empty(key);
        if let Some(entry) = self.entries.get(key) {
            snapshot.bars = entry.bars.iter().cloned().collect();
            snapshot.indicators.clone_from(&entry.indicators);
        }
        snapshot
    }

    /// Closed bars held for a series, oldest first.
    #[must_use]
    pub fn bars(&self, key: &SeriesKey) -> Vec<Bar> {
        self.entries
            .get(key)
            .map(|e| e.bars.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Newest closed bar held for a series.
    #[must_use]
    pub fn last_bar(&self, key: &SeriesKey) -> Option<&Bar> {
        self.entries.get(key).and_then(|e| e.bars.back())
    }

    /// Number of bars held for a series.
    #[must_use]
    pub fn len(&self, key: &SeriesKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.bars.len())
    }

    /// Whether nothing is held for a series.
    #[must_use]
    pub fn is_empty(&self, key: &SeriesKey) -> bool {
        self.len(key) == 0
    }

    /// Number of series with an entry.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Load historical bars for a series (oldest first).
    ///
    /// Bars must be closed, aligned to the series timeframe and strictly
    /// ordered. Only bars that end at or before the first bar already held
    /// are added, so live history is never overwritten. If more bars than
    /// capacity are supplied, the newest are kept.
    ///
    /// Returns the number of bars added.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure; nothing is stored in that case.
    pub fn seed(&mut self, key: &SeriesKey, bars: &[Bar]) -> Result<usize, SeedError> {
        validate_history(key, bars)?;

        let entry = self.entries.entry(key.clone()).or_default();
        let boundary = entry.bars.front().map(|b| b.start_time);
        let mut added = 0;
        for bar in bars
            .iter()
            .rev()
            .filter(|b| boundary.is_none_or(|start| b.end_time <= start))
        {
            if entry.bars.len() >= self.capacity {
                break;
            }
            entry.bars.push_front(bar.clone());
            added += 1;
        }
        if entry.bars.is_empty() && entry.indicators.is_empty() {
            self.entries.remove(key);
        }
        Ok(added)
    }

    /// Drop everything held for a series.
    ///
    /// Returns whether an entry existed.
    pub fn remove(&mut self, key: &SeriesKey) -> bool {
        self.entries.remove(key).is_some()
    }
}

fn merge_outputs(latest: &mut Vec<IndicatorOutput>, outputs: &[IndicatorOutput]) {
    for output in outputs {
        match latest.iter_mut().find(|o| o.indicator == output.indicator) {
            Some(slot) => slot.clone_from(output),
            None => latest.push(output.clone()),
        }
    }
}

fn validate_history(key: &SeriesKey, bars: &[Bar]) -> Result<(), SeedError> {
    let tf = key.timeframe;
    for (index, bar) in bars.iter().enumerate() {
        if bar.symbol != key.symbol || bar.timeframe != tf {
            return Err(SeedError::Mismatched {
                index,
                expected: key.clone(),
                found: bar.key(),
            });
        }
        if !bar.closed {
            return Err(SeedError::Open { index });
        }
        let start = bar.start_millis();
        if tf.bucket_start(start) != start || bar.end_millis() - start != tf.as_millis() {
            return Err(SeedError::Misaligned { index });
        }
        if index > 0 && bar.start_time < bars[index - 1].end_time {
            return Err(SeedError::Unordered { index });
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::indicators::{IndicatorPhase, IndicatorValue};
    use crate::domain::market::millis_to_utc;

    fn key() -> SeriesKey {
        SeriesKey::new("ETH-USD", Timeframe::MINUTE)
    }

    fn bar(i: i64) -> Bar {
        let start = i * 60_000;
        Bar {
            symbol: "ETH-USD".to_string(),
            timeframe: Timeframe::MINUTE,
            start_time: millis_to_utc(start),
            end_time: millis_to_utc(start + 60_000),
            open: Decimal::from(i),
            high: Decimal::from(i),
            low: Decimal::from(i),
            close: Decimal::from(i),
            volume: Decimal::ONE,
            tick_count: 1,
            closed: true,
            synthesized: false,
        }
    }

    fn sma_output(i: i64, value: f64) -> IndicatorOutput {
        IndicatorOutput {
            indicator: IndicatorKind::Sma { period: 2 },
            time: millis_to_utc((i + 1) * 60_000),
            phase: IndicatorPhase::Ready,
            value: Some(IndicatorValue::Sma { value }),
        }
    }

    #[test]
    fn ring_buffer_keeps_newest() {
        let mut cache = SnapshotCache::new(3);
        for i in 0..5 {
            assert!(cache.record(&bar(i), &[]));
        }
        let snapshot = cache.get_snapshot(&key());
        let starts: Vec<i64> = snapshot.bars.iter().map(Bar::start_millis).collect();
        assert_eq!(starts, vec![120_000, 180_000, 240_000]);
    }

    #[test]
    fn record_ignores_open_and_stale_bars() {
        let mut cache = SnapshotCache::new(10);
        let mut open = bar(0);
        open.closed = false;
        assert!(!cache.record(&open, &[]));

        assert!(cache.record(&bar(1), &[]));
        assert!(!cache.record(&bar(1), &[]));
        assert!(!cache.record(&bar(0), &[]));
        assert_eq!(cache.len(&key()), 1);
    }

    #[test]
    fn latest_indicator_value_replaces_previous() {
        let mut cache = SnapshotCache::new(10);
        cache.record(&bar(0), &[sma_output(0, 1.0)]);
        cache.record(&bar(1), &[sma_output(1, 2.0)]);
        let snapshot = cache.get_snapshot(&key());
        assert_eq!(snapshot.indicators.len(), 1);
        assert_eq!(
            snapshot.indicators[0].value,
            Some(IndicatorValue::Sma { value: 2.0 })
        );
    }

    #[test]
    fn unknown_key_gives_empty_snapshot() {
        let cache = SnapshotCache::default();
        let snapshot = cache.get_snapshot(&key());
        assert!(snapshot.bars.is_empty());
        assert!(snapshot.indicators.is_empty());
        assert_eq!(snapshot.symbol, "ETH-USD");
    }

    #[test]
    fn seed_prepends_history_before_live_bars() {
        let mut cache = SnapshotCache::new(10);
        cache.record(&bar(5), &[]);
        let history: Vec<Bar> = (0..7).map(bar).collect();
        // Bars 5 and 6 overlap live history and are skipped.
        assert_eq!(cache.seed(&key(), &history).unwrap(), 5);
        let starts: Vec<i64> = cache
            .bars(&key())
            .iter()
            .map(|b| b.start_millis() / 60_000)
            .collect();
        assert_eq!(starts, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn seed_respects_capacity() {
        let mut cache = SnapshotCache::new(3);
        let history: Vec<Bar> = (0..10).map(bar).collect();
        assert_eq!(cache.seed(&key(), &history).unwrap(), 3);
        assert_eq!(cache.last_bar(&key()).map(Bar::start_millis), Some(9 * 60_000));
    }

    #[test]
    fn seed_rejects_bad_history() {
        let mut cache = SnapshotCache::new(10);

        let mut open = vec![bar(0), bar(1)];
        open[1].closed = false;
        assert_eq!(cache.seed(&key(), &open), Err(SeedError::Open { index: 1 }));

        let unordered = vec![bar(2), bar(1)];
        assert_eq!(
            cache.seed(&key(), &unordered),
            Err(SeedError::Unordered { index: 1 })
        );

        let mut other = vec![bar(0)];
        other[0].symbol = "BTC-USD".to_string();
        assert!(matches!(
            cache.seed(&key(), &other),
            Err(SeedError::Mismatched { index: 0, .. })
        ));

        let mut misaligned = vec![bar(0)];
        misaligned[0].start_time = millis_to_utc(1_000);
        assert_eq!(
            cache.seed(&key(), &misaligned),
            Err(SeedError::Misaligned { index: 0 })
        );

        assert!(cache.is_empty(&key()));
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn remove_drops_entry() {
        let mut cache = SnapshotCache::default();
        cache.record(&bar(0), &[]);
        assert!(cache.remove(&key()));
        assert!(!cache.remove(&key()));
        assert_eq!(cache.entry_count(), 0);
    }
}
