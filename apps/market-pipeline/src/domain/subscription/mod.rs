//! Subscription Interest Tracking
//!
//! Domain types for tracking which subscribers want which series and
//! indicators.
//!
//! # Design
//!
//! The interest index tracks:
//! - Which series (symbol, timeframe) each subscriber is attached to
//! - Which indicators each subscriber wants on that series
//! - A reverse index from series and from (series, indicator) to subscribers
//!
//! Reference counts fall out of the reverse index: a series or indicator is
//! unreferenced when its subscriber set empties. Callers use the returned
//! [`InterestChanges`] to create shared state on the first reference and
//! schedule teardown on the last release.

use std::collections::{HashMap, HashSet};

use super::indicators::IndicatorKind;
use super::market::SeriesKey;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a subscriber (one push connection).
pub type SubscriberId = u64;

// =============================================================================
// Interest Changes
// =============================================================================

/// Shared-state changes caused by one attach or detach.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterestChanges {
    /// The series gained its first subscriber.
    pub series_referenced: bool,
    /// The series lost its last subscriber.
    pub series_released: bool,
    /// Indicators that gained their first subscriber.
    pub indicators_referenced: Vec<IndicatorKind>,
    /// Indicators that lost their last subscriber.
    pub indicators_released: Vec<IndicatorKind>,
}

impl InterestChanges {
    /// Check if any shared state needs creating or releasing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.series_referenced
            && !self.series_released
            && self.indicators_referenced.is_empty()
            && self.indicators_released.is_empty()
    }
}

// =============================================================================
// Interest Index
// =============================================================================

/// Reverse index from series and indicators to interested subscribers.
///
/// Not synchronized; the router wraps it in a lock.
///
/// # Example
///
/// ```rust
/// use market_pipeline::domain::indicators::IndicatorKind;
/// use market_pipeline::domain::market::{SeriesKey, Timeframe};
/// use market_pipeline::domain::subscription::InterestIndex;
///
/// let mut index = InterestIndex::new();
/// let key = SeriesKey::new("BTC-USD", Timeframe::MINUTE);
/// let sma = IndicatorKind::Sma { period: 20 };
///
/// // First subscriber creates shared interest
/// let changes = index.attach(1, &key, &[sma]);
/// assert!(changes.series_referenced);
/// assert_eq!(changes.indicators_referenced, vec![sma]);
///
/// // Second subscriber shares it
/// let changes = index.attach(2, &key, &[sma]);
/// assert!(changes.is_empty());
///
/// // Last detach releases it
/// index.detach(1, &key);
/// let changes = index.detach(2, &key);
/// assert!(changes.series_released);
/// assert_eq!(changes.indicators_released, vec![sma]);
/// ```
#[derive(Debug, Default)]
pub struct InterestIndex {
    /// Subscriber → series → wanted indicators.
    by_subscriber: HashMap<SubscriberId, HashMap<SeriesKey, Vec<IndicatorKind>>>,
    /// Series → subscribers (bar events).
    series_subscribers: HashMap<SeriesKey, HashSet<SubscriberId>>,
    /// (Series, indicator) → subscribers (indicator events).
    indicator_subscribers: HashMap<(SeriesKey, IndicatorKind), HashSet<SubscriberId>>,
}

impl InterestIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber to a series with an indicator set.
    ///
    /// Attaching again to the same series replaces the indicator set.
    pub fn attach(
        &mut self,
        subscriber: SubscriberId,
        key: &SeriesKey,
        indicators: &[IndicatorKind],
    ) -> InterestChanges {
        let mut changes = InterestChanges::default();

        let mut wanted: Vec<IndicatorKind> = Vec::with_capacity(indicators.len());
        for kind in indicators {
            if !wanted.contains(kind) {
                wanted.push(*kind);
            }
        }

        let series = self.series_subscribers.entry(key.clone()).or_default();
        if series.is_empty() {
            changes.series_referenced = true;
        }
        series.insert(subscriber);

        let previous = self
            .by_subscriber
            .entry(subscriber)
            .or_default()
            .insert(key.clone(), wanted.clone())
            .unwrap_or_default();

        for kind in previous.iter().filter(|k| !wanted.contains(k)) {
            if self.release_indicator(subscriber, key, *kind) {
                changes.indicators_released.push(*kind);
            }
        }

        for kind in wanted.iter().filter(|k| !previous.contains(k)) {
            let subscribers = self
                .indicator_subscribers
                .entry((key.clone(), *kind))
                .or_default();
            if subscribers.is_empty() {
                changes.indicators_referenced.push(*kind);
            }
            subscribers.insert(subscriber);
        }

        changes
    }

    /// Detach a subscriber from a series.
    pub fn detach(&mut self, subscriber: SubscriberId, key: &SeriesKey) -> InterestChanges {
        let Some(series_map) = self.by_subscriber.get_mut(&subscriber) else {
            return InterestChanges::default();
        };
        let Some(kinds) = series_map.remove(key) else {
            return InterestChanges::default();
        };
        if series_map.is_empty() {
            self.by_subscriber.remove(&subscriber);
        }

        let mut changes = InterestChanges::default();
        for kind in kinds {
            if self.release_indicator(subscriber, key, kind) {
                changes.indicators_released.push(kind);
            }
        }

        if let Some(series) = self.series_subscribers.get_mut(key) {
            series.remove(&subscriber);
            if series.is_empty() {
                self.series_subscribers.remove(key);
                changes.series_released = true;
            }
        }

        changes
    }

    /// Remove every interest of a subscriber.
    ///
    /// Returns the changes per affected series.
    pub fn disconnect(&mut self, subscriber: SubscriberId) -> Vec<(SeriesKey, InterestChanges)> {
        let keys: Vec<SeriesKey> = self
            .by_subscriber
            .get(&subscriber)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();

        keys.into_iter()
            .map(|key| {
                let changes = self.detach(subscriber, &key);
                (key, changes)
            })
            .collect()
    }

    /// Returns whether the indicator lost its last subscriber.
    fn release_indicator(
        &mut self,
        subscriber: SubscriberId,
        key: &SeriesKey,
        kind: IndicatorKind,
    ) -> bool {
        let index_key = (key.clone(), kind);
        let Some(subscribers) = self.indicator_subscribers.get_mut(&index_key) else {
            return false;
        };
        if !subscribers.remove(&subscriber) || !subscribers.is_empty() {
            return false;
        }
        self.indicator_subscribers.remove(&index_key);
        true
    }

    /// Subscribers attached to a series.
    #[must_use]
    pub fn series_subscribers(&self, key: &SeriesKey) -> Vec<SubscriberId> {
        self.series_subscribers
            .get(key)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Subscribers wanting an indicator on a series.
    #[must_use]
    pub fn indicator_subscribers(&self, key: &SeriesKey, kind: IndicatorKind) -> Vec<SubscriberId> {
        self.indicator_subscribers
            .get(&(key.clone(), kind))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of subscribers on a series.
    #[must_use]
    pub fn series_refcount(&self, key: &SeriesKey) -> usize {
        self.series_subscribers.get(key).map_or(0, HashSet::len)
    }

    /// Number of subscribers wanting an indicator on a series.
    #[must_use]
    pub fn indicator_refcount(&self, key: &SeriesKey, kind: IndicatorKind) -> usize {
        self.indicator_subscribers
            .get(&(key.clone(), kind))
            .map_or(0, HashSet::len)
    }

    /// Series a subscriber is attached to.
    #[must_use]
    pub fn subscriber_series(&self, subscriber: SubscriberId) -> Vec<SeriesKey> {
        self.by_subscriber
            .get(&subscriber)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Indicators a subscriber wants on a series.
    #[must_use]
    pub fn subscriber_indicators(
        &self,
        subscriber: SubscriberId,
        key: &SeriesKey,
    ) -> Vec<IndicatorKind> {
        self.by_subscriber
            .get(&subscriber)
            .and_then(|m| m.get(key))
            .cloned()
            .unwrap_or_default()
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> InterestStats {
        InterestStats {
            subscriber_count: self.by_subscriber.len(),
            series_count: self.series_subscribers.len(),
            indicator_count: self.indicator_subscribers.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Interest index statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct InterestStats {
    /// Subscribers with at least one attachment.
    pub subscriber_count: usize,
    /// Series with at least one subscriber.
    pub series_count: usize,
    /// (Series, indicator) pairs with at least one subscriber.
    pub indicator_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
