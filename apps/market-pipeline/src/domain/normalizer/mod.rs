//! Tick Normalizer
//!
//! Buckets raw ticks into contiguous OHLCV bars per (symbol, timeframe).
//!
//! # Rules
//!
//! - A tick in the open bucket updates the bar in place.
//! - A tick for a later bucket closes the open bar and opens a new one.
//!   Empty buckets in between are synthesized as flat zero-volume bars
//!   carrying the previous close, so the series stays contiguous.
//! - A tick for an already-closed bucket is late and is dropped. Closed
//!   bars have already been distributed downstream and are immutable.
//! - After a reconnect gap, the next tick's bucket starts fresh: nothing is
//!   synthesized across the outage.

use std::collections::HashMap;

use rust_decimal::Decimal;

use super::market::{Bar, SeriesKey, Symbol, Tick, Timeframe, millis_to_utc};

/// Default cap on synthesized bars for a single gap.
pub const DEFAULT_MAX_GAP_FILL: usize = 500;

// =============================================================================
// Rejections
// =============================================================================

/// Why a tick (or one timeframe's view of it) was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum TickRejection {
    /// Missing symbol, non-positive price or negative volume.
    #[error("malformed tick")]
    Malformed,
    /// No series is registered for the tick's symbol.
    #[error("no series registered for symbol")]
    Unrouted,
    /// The tick's bucket has already closed.
    #[error("late tick for closed bucket")]
    Late,
    /// Same bucket, but older than the last accepted tick.
    #[error("out-of-order tick")]
    OutOfOrder,
}

impl TickRejection {
    /// Metric label for this rejection.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Unrouted => "unrouted",
            Self::Late => "late",
            Self::OutOfOrder => "out_of_order",
        }
    }
}

/// Result of applying one tick to every registered timeframe of its symbol.
#[derive(Debug, Clone, Default)]
pub struct NormalizedTick {
    /// Bars closed by this tick, oldest first per timeframe, including
    /// synthesized ones.
    pub closed: Vec<Bar>,
    /// Open bars updated by this tick.
    pub updated: Vec<Bar>,
    /// Timeframes that rejected the tick.
    pub rejected: Vec<(Timeframe, TickRejection)>,
    /// Timeframes that jumped over more empty buckets than the fill cap,
    /// with the number of buckets left out. The series is discontinuous there.
    pub skipped: Vec<(Timeframe, i64)>,
}

// =============================================================================
// Series Builder
// =============================================================================

#[derive(Debug)]
struct SeriesBuilder {
    symbol: Symbol,
    timeframe: Timeframe,
    open: Option<Bar>,
    last_closed_end: Option<i64>,
    last_close: Option<Decimal>,
    last_tick_ms: Option<i64>,
    gap_pending: bool,
}

impl SeriesBuilder {
    fn new(key: &SeriesKey, history_tail: Option<&Bar>) -> Self {
        Self {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            open: None,
            last_closed_end: history_tail.map(Bar::end_millis),
            last_close: history_tail.map(|b| b.close),
            last_tick_ms: None,
            gap_pending: false,
        }
    }

    fn apply(
        &mut self,
        tick: &Tick,
        max_gap_fill: usize,
        closed: &mut Vec<Bar>,
        skipped: &mut Vec<(Timeframe, i64)>,
    ) -> Result<Bar, TickRejection> {
        let ts = tick.timestamp_millis();
        let bucket = self.timeframe.bucket_start(ts);

        if let Some(bar) = self.open.as_mut() {
            let start = bar.start_millis();
            if bucket == start {
                if self.last_tick_ms.is_some_and(|last| ts < last) {
                    return Err(TickRejection::OutOfOrder);
                }
                bar.high = bar.high.max(tick.price);
                bar.low = bar.low.min(tick.price);
                bar.close = tick.price;
                bar.volume += tick.volume;
                bar.tick_count += 1;
                self.last_tick_ms = Some(ts);
                return Ok(bar.clone());
            }
            if bucket < start {
                return Err(TickRejection::Late);
            }
            self.close_open(closed);
        } else if self.last_closed_end.is_some_and(|end| bucket < end) {
            return Err(TickRejection::Late);
        }

        if self.gap_pending {
            self.gap_pending = false;
        } else if let Some(missing) = self.fill_gap(bucket, max_gap_fill, closed) {
            skipped.push((self.timeframe, missing));
        }

        let bar = Bar {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            start_time: millis_to_utc(bucket),
            end_time: millis_to_utc(bucket + self.timeframe.as_millis()),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
            tick_count: 1,
            closed: false,
            synthesized: false,
        };
        self.open = Some(bar.clone());
        self.last_tick_ms = Some(ts);
        Ok(bar)
    }

    fn close_open(&mut self, closed: &mut Vec<Bar>) {
        if let Some(mut bar) = self.open.take() {
            bar.closed = true;
            self.last_closed_end = Some(bar.end_millis());
            self.last_close = Some(bar.close);
            closed.push(bar);
        }
    }

    /// Synthesize flat bars from the last closed end up to `bucket`.
    ///
    /// Returns the number of missing buckets when there are more than
    /// `max_gap_fill` of them and nothing was synthesized.
    fn fill_gap(
        &mut self,
        bucket: i64,
        max_gap_fill: usize,
        closed: &mut Vec<Bar>,
    ) -> Option<i64> {
        let (Some(mut start), Some(price)) = (self.last_closed_end, self.last_close) else {
            return None;
        };

        let step = self.timeframe.as_millis();
        let missing = (bucket - start) / step;
        if missing <= 0 {
            return None;
        }
        if usize::try_from(missing).map_or(true, |m| m > max_gap_fill) {
            tracing::warn!(
                symbol = %self.symbol,
                timeframe = %self.timeframe,
                missing,
                max_gap_fill,
                "Gap too large to synthesize, series resumes discontinuous"
            );
            return Some(missing);
        }

        while start < bucket {
            closed.push(flat_bar(&self.symbol, self.timeframe, start, price));
            start += step;
        }
        self.last_closed_end = Some(bucket);
        None
    }
}

fn flat_bar(symbol: &str, timeframe: Timeframe, start: i64, price: Decimal) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        timeframe,
        start_time: millis_to_utc(start),
        end_time: millis_to_utc(start + timeframe.as_millis()),
        open: price,
        high: price,
        low: price,
        close: price,
        volume: Decimal::ZERO,
        tick_count: 0,
        closed: true,
        synthesized: true,
    }
}

// =============================================================================
// Tick Normalizer
// =============================================================================

/// Builds bars for every registered (symbol, timeframe) series.
///
/// Not thread-safe: each pipeline shard owns one normalizer and feeds it a
/// single symbol's ticks in arrival order.
///
/// # Example
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use market_pipeline::domain::market::{SeriesKey, Tick, Timeframe};
/// use market_pipeline::domain::normalizer::TickNormalizer;
/// use rust_decimal::Decimal;
///
/// let mut normalizer = TickNormalizer::default();
/// normalizer.register(&SeriesKey::new("BTC-USD", Timeframe::MINUTE), None);
///
/// let t0 = Utc.timestamp_millis_opt(0).unwrap();
/// let out = normalizer.on_tick(&Tick::new("BTC-USD", Decimal::from(100), Decimal::ONE, t0)).unwrap();
/// assert!(out.closed.is_empty());
/// assert_eq!(out.updated.len(), 1);
/// ```
#[derive(Debug)]
pub struct TickNormalizer {
    series: HashMap<Symbol, HashMap<Timeframe, SeriesBuilder>>,
    max_gap_fill: usize,
}

impl Default for TickNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_GAP_FILL)
    }
}

impl TickNormalizer {
    /// Create a normalizer that synthesizes at most `max_gap_fill` empty
    /// bars per gap.
    #[must_use]
    pub fn new(max_gap_fill: usize) -> Self {
        Self {
            series: HashMap::new(),
            max_gap_fill,
        }
    }

    /// Start building bars for a series.
    ///
    /// `history_tail` is the last known closed bar (e.g. from seeded
    /// history); ticks before its end are treated as late and the gap up to
    /// the first live tick is filled.
    ///
    /// Returns `false` if the series was already registered.
    pub fn register(&mut self, key: &SeriesKey, history_tail: Option<&Bar>) -> bool {
        let timeframes = self.series.entry(key.symbol.clone()).or_default();
        if timeframes.contains_key(&key.timeframe) {
            return false;
        }
        timeframes.insert(key.timeframe, SeriesBuilder::new(key, history_tail));
        true
    }

    /// Stop building bars for a series, discarding any open bar.
    ///
    /// Returns `false` if the series was not registered.
    pub fn unregister(&mut self, key: &SeriesKey) -> bool {
        let Some(timeframes) = self.series.get_mut(&key.symbol) else {
            return false;
        };
        let removed = timeframes.remove(&key.timeframe).is_some();
        if timeframes.is_empty() {
            self.series.remove(&key.symbol);
        }
        removed
    }

    /// Whether any timeframe is registered for `symbol`.
    #[must_use]
    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.series.contains_key(symbol)
    }

    /// Whether a series is registered.
    #[must_use]
    pub fn is_registered(&self, key: &SeriesKey) -> bool {
        self.series
            .get(&key.symbol)
            .is_some_and(|tfs| tfs.contains_key(&key.timeframe))
    }

    /// Number of registered series.
    #[must_use]
    pub fn series_count(&self) -> usize {
        self.series.values().map(HashMap::len).sum()
    }

    /// Current open bar for a series.
    #[must_use]
    pub fn open_bar(&self, key: &SeriesKey) -> Option<&Bar> {
        self.series
            .get(&key.symbol)
            .and_then(|tfs| tfs.get(&key.timeframe))
            .and_then(|b| b.open.as_ref())
    }

    /// Apply a tick to every registered timeframe of its symbol.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` for invalid ticks and `Unrouted` when no series
    /// exists for the symbol. Per-timeframe rejections (late, out-of-order)
    /// are reported in [`NormalizedTick::rejected`].
    pub fn on_tick(&mut self, tick: &Tick) -> Result<NormalizedTick, TickRejection> {
        validate(tick)?;

        let Some(timeframes) = self.series.get_mut(&tick.symbol) else {
            return Err(TickRejection::Unrouted);
        };

        let mut out = NormalizedTick::default();
        for (timeframe, builder) in timeframes.iter_mut() {
            match builder.apply(tick, self.max_gap_fill, &mut out.closed, &mut out.skipped) {
                Ok(bar) => out.updated.push(bar),
                Err(rejection) => out.rejected.push((*timeframe, rejection)),
            }
        }
        Ok(out)
    }

    /// Close every open bar whose bucket ended at or before `now_ms`.
    ///
    /// Lets quiet series close on time instead of waiting for the next tick.
    pub fn close_expired(&mut self, now_ms: i64) -> Vec<Bar> {
        let mut closed = Vec::new();
        for builder in self.series.values_mut().flat_map(HashMap::values_mut) {
            if builder.open.as_ref().is_some_and(|b| b.end_millis() <= now_ms) {
                builder.close_open(&mut closed);
            }
        }
        closed
    }

    /// Mark every series as having a potential gap (feed reconnected).
    ///
    /// The next tick opens its own bucket without synthesizing the buckets
    /// missed during the outage.
    pub fn mark_gap(&mut self) {
        for builder in self.series.values_mut().flat_map(HashMap::values_mut) {
            builder.gap_pending = true;
        }
    }
}

fn validate(tick: &Tick) -> Result<(), TickRejection> {
    if tick.symbol.is_empty() || tick.price <= Decimal::ZERO || tick.volume < Decimal::ZERO {
        return Err(TickRejection::Malformed);
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
