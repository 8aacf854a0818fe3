//! Pipeline
//!
//! One explicitly constructed instance owning every stage:
//! normalizer → indicator engine → {snapshot cache, subscription router}.
//!
//! # Sharding
//!
//! Symbols hash to one of N shards. Each shard owns its own normalizer,
//! indicator engine and snapshot cache behind a mutex, so ticks for one
//! symbol are applied strictly in order while different shards progress
//! independently.
//!
//! # Lock Order
//!
//! shard → router → pending teardowns. The pending map is never held while
//! taking a shard lock.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::router::{DEFAULT_SUBSCRIBER_BUFFER, RouterStats, SubscriberHandle, SubscriptionRouter};
use crate::application::ports::{FeedControl, HistoryError, HistoryProvider};
use crate::domain::indicators::{IndicatorEngine, IndicatorError, IndicatorKind};
use crate::domain::market::{Bar, SeriesKey, Tick};
use crate::domain::normalizer::{DEFAULT_MAX_GAP_FILL, TickNormalizer};
use crate::domain::snapshot::{DEFAULT_SNAPSHOT_CAPACITY, SeedError, Snapshot, SnapshotCache};
use crate::domain::streaming::{ConnectionState, PushEvent};
use crate::domain::subscription::{InterestChanges, SubscriberId};
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Settings
// =============================================================================

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Closed bars kept per series.
    pub snapshot_capacity: usize,
    /// Outbound queue capacity per subscriber.
    pub subscriber_buffer: usize,
    /// Delay between the last detach and teardown.
    pub grace_period: Duration,
    /// Number of independent shards.
    pub shards: usize,
    /// Cap on synthesized bars per gap.
    pub max_gap_fill: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            grace_period: Duration::from_secs(30),
            shards: 4,
            max_gap_fill: DEFAULT_MAX_GAP_FILL,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Attach request rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttachError {
    /// The subscriber is not connected.
    #[error("unknown subscriber {0}")]
    UnknownSubscriber(SubscriberId),

    /// The symbol was empty.
    #[error("symbol must not be empty")]
    EmptySymbol,

    /// An indicator had invalid parameters.
    #[error("invalid indicator: {0}")]
    Indicator(#[from] IndicatorError),
}

// =============================================================================
// Statistics
// =============================================================================

/// In-process counters mirroring the drop and throughput metrics.
#[derive(Debug, Default)]
pub struct PipelineStats {
    ticks_received: AtomicU64,
    ticks_processed: AtomicU64,
    dropped_queue_overflow: AtomicU64,
    dropped_shard_overflow: AtomicU64,
    dropped_late: AtomicU64,
    dropped_out_of_order: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_unrouted: AtomicU64,
    bars_closed: AtomicU64,
    bars_synthesized: AtomicU64,
    bar_discontinuities: AtomicU64,
    indicator_computations: AtomicU64,
    reconnects: AtomicU64,
}

impl PipelineStats {
    /// Count a tick handed to the pipeline.
    pub fn record_received(&self) {
        self.ticks_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_tick_received();
    }

    /// Count dropped ticks.
    pub fn record_drop(&self, reason: DropReason, count: u64) {
        let counter = match reason {
            DropReason::QueueOverflow => &self.dropped_queue_overflow,
            DropReason::ShardOverflow => &self.dropped_shard_overflow,
            DropReason::Late => &self.dropped_late,
            DropReason::OutOfOrder => &self.dropped_out_of_order,
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::Unrouted => &self.dropped_unrouted,
        };
        counter.fetch_add(count, Ordering::Relaxed);
        metrics::record_ticks_dropped(reason, count);
    }

    /// Count a feed reconnection attempt.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::record_reconnect();
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            ticks_received: load(&self.ticks_received),
            ticks_processed: load(&self.ticks_processed),
            dropped_queue_overflow: load(&self.dropped_queue_overflow),
            dropped_shard_overflow: load(&self.dropped_shard_overflow),
            dropped_late: load(&self.dropped_late),
            dropped_out_of_order: load(&self.dropped_out_of_order),
            dropped_malformed: load(&self.dropped_malformed),
            dropped_unrouted: load(&self.dropped_unrouted),
            bars_closed: load(&self.bars_closed),
            bars_synthesized: load(&self.bars_synthesized),
            bar_discontinuities: load(&self.bar_discontinuities),
            indicator_computations: load(&self.indicator_computations),
            reconnects: load(&self.reconnects),
        }
    }
}

/// Copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Ticks handed to the pipeline (before queueing).
    pub ticks_received: u64,
    /// Ticks taken off the queue and applied or rejected.
    pub ticks_processed: u64,
    /// Ticks evicted from the full tick queue.
    pub dropped_queue_overflow: u64,
    /// Ticks dropped because their shard worker was behind.
    pub dropped_shard_overflow: u64,
    /// Ticks for already-closed buckets.
    pub dropped_late: u64,
    /// Ticks earlier than the last accepted one in the same bucket.
    pub dropped_out_of_order: u64,
    /// Undecodable frames and invalid ticks.
    pub dropped_malformed: u64,
    /// Ticks with no registered series.
    pub dropped_unrouted: u64,
    /// Bars closed, including synthesized ones.
    pub bars_closed: u64,
    /// Synthesized gap-filler bars.
    pub bars_synthesized: u64,
    /// Gaps too large to fill, where a series jumps ahead without filler bars.
    pub bar_discontinuities: u64,
    /// Per-bar indicator updates.
    pub indicator_computations: u64,
    /// Feed reconnection attempts.
    pub reconnects: u64,
}

/// Pipeline-wide status for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Counters.
    pub stats: StatsSnapshot,
    /// Router counts.
    pub router: RouterStats,
    /// Series being normalized (including ones in their grace period).
    pub series: usize,
    /// Teardowns waiting for their grace period.
    pub pending_teardowns: usize,
}

// =============================================================================
// Pipeline
// =============================================================================

#[derive(Debug)]
struct Shard {
    normalizer: TickNormalizer,
    engine: IndicatorEngine,
    snapshots: SnapshotCache,
}

type PendingKey = (SeriesKey, Option<IndicatorKind>);

/// The market-data pipeline.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Pipeline {
    settings: PipelineSettings,
    shards: Vec<Mutex<Shard>>,
    router: SubscriptionRouter,
    feed: Arc<dyn FeedControl>,
    stats: Arc<PipelineStats>,
    pending: Mutex<HashMap<PendingKey, Instant>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("settings", &self.settings)
            .field("shards", &self.shards.len())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create a pipeline that requests upstream symbols through `feed`.
    #[must_use]
    pub fn new(settings: PipelineSettings, feed: Arc<dyn FeedControl>) -> Self {
        Self::with_stats(settings, feed, Arc::new(PipelineStats::default()))
    }

    /// Create a pipeline recording into existing counters.
    ///
    /// Lets the tick queue be built before the feed handle exists.
    #[must_use]
    pub fn with_stats(
        settings: PipelineSettings,
        feed: Arc<dyn FeedControl>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let shards = (0..settings.shards.max(1))
            .map(|_| {
                Mutex::new(Shard {
                    normalizer: TickNormalizer::new(settings.max_gap_fill),
                    engine: IndicatorEngine::new(),
                    snapshots: SnapshotCache::new(settings.snapshot_capacity),
                })
            })
            .collect();

        Self {
            router: SubscriptionRouter::new(settings.subscriber_buffer),
            settings,
            shards,
            feed,
            stats,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// The subscription router.
    #[must_use]
    pub const fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    /// Pipeline settings.
    #[must_use]
    pub const fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard owning `symbol`.
    #[must_use]
    pub fn shard_index(&self, symbol: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        let count = u64::try_from(self.shards.len()).unwrap_or(1);
        usize::try_from(hasher.finish() % count).unwrap_or(0)
    }

    fn shard(&self, symbol: &str) -> &Mutex<Shard> {
        &self.shards[self.shard_index(symbol)]
    }

    // =========================================================================
    // Subscribers
    // =========================================================================

    /// Register a new subscriber.
    pub fn connect(&self) -> SubscriberHandle {
        self.router.connect()
    }

    /// Attach a subscriber to a series with an indicator set.
    ///
    /// Creates normalizer series and indicator state on first use (replaying
    /// any cached history into new indicators), then enqueues a snapshot for
    /// the subscriber before any live update for the series can reach it.
    /// Attaching again replaces the subscriber's indicator set.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown subscribers, an empty symbol or invalid
    /// indicator parameters.
    pub fn attach(
        &self,
        subscriber: SubscriberId,
        key: &SeriesKey,
        indicators: &[IndicatorKind],
    ) -> Result<(), AttachError> {
        if key.symbol.trim().is_empty() {
            return Err(AttachError::EmptySymbol);
        }
        for kind in indicators {
            kind.validate()?;
        }
        if !self.router.is_connected(subscriber) {
            return Err(AttachError::UnknownSubscriber(subscriber));
        }

        self.cancel_teardown(key, indicators);

        let mut guard = self.shard(&key.symbol).lock();
        let Shard {
            normalizer,
            engine,
            snapshots,
        } = &mut *guard;

        let new_symbol = !normalizer.has_symbol(&key.symbol);
        if !normalizer.is_registered(key) {
            normalizer.register(key, snapshots.last_bar(key));
        }

        let missing: Vec<IndicatorKind> = indicators
            .iter()
            .copied()
            .filter(|kind| !engine.is_registered(key, *kind))
            .collect();
        if !missing.is_empty() {
            let history = snapshots.bars(key);
            for kind in &missing {
                engine.register(key, *kind, &history);
            }
            tracing::debug!(
                series = %key,
                created = missing.len(),
                replayed = history.len(),
                "Indicator state created"
            );
        }

        let Some(changes) = self.router.attach(subscriber, key, indicators) else {
            return Err(AttachError::UnknownSubscriber(subscriber));
        };
        self.schedule_teardown(key, &changes);

        let mut snapshot = snapshots.get_snapshot(key);
        snapshot.indicators = engine.snapshot_outputs(key, snapshots.last_bar(key));
        snapshot.retain_indicators(indicators);
        snapshot.open_bar = normalizer.open_bar(key).cloned();
        self.router.send_to(subscriber, PushEvent::snapshot(snapshot));

        if new_symbol {
            self.feed.subscribe(&key.symbol);
        }
        drop(guard);

        tracing::info!(
            subscriber_id = subscriber,
            series = %key,
            indicators = indicators.len(),
            "Subscriber attached"
        );
        Ok(())
    }

    /// Detach a subscriber from a series.
    ///
    /// The last detach schedules teardown after the grace period.
    /// Returns whether the subscriber was attached.
    pub fn detach(&self, subscriber: SubscriberId, key: &SeriesKey) -> bool {
        let Some(changes) = self.router.detach(subscriber, key) else {
            return false;
        };
        self.schedule_teardown(key, &changes);
        tracing::info!(subscriber_id = subscriber, series = %key, "Subscriber detached");
        true
    }

    /// Remove a subscriber and every interest it holds.
    pub fn disconnect(&self, subscriber: SubscriberId) {
        for (key, changes) in self.router.disconnect(subscriber) {
            self.schedule_teardown(&key, &changes);
        }
    }

    fn schedule_teardown(&self, key: &SeriesKey, changes: &InterestChanges) {
        if !changes.series_released && changes.indicators_released.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.settings.grace_period;
        let mut pending = self.pending.lock();
        if changes.series_released {
            pending.insert((key.clone(), None), deadline);
        }
        for kind in &changes.indicators_released {
            pending.insert((key.clone(), Some(*kind)), deadline);
        }
    }

    fn cancel_teardown(&self, key: &SeriesKey, indicators: &[IndicatorKind]) {
        let mut pending = self.pending.lock();
        pending.remove(&(key.clone(), None));
        for kind in indicators {
            pending.remove(&(key.clone(), Some(*kind)));
        }
    }

    /// Tear down series and indicators whose grace period ended by `now`
    /// and that nobody re-attached to.
    ///
    /// Releases the upstream symbol once none of its timeframes remain.
    /// Returns the number of series and indicators torn down.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut expired: Vec<PendingKey> = {
            let mut pending = self.pending.lock();
            let keys: Vec<PendingKey> = pending
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                pending.remove(key);
            }
            keys
        };
        // Indicators before their series so both are counted.
        expired.sort_by_key(|(_, kind)| kind.is_none());

        let mut torn_down = 0;
        for (key, kind) in expired {
            let mut guard = self.shard(&key.symbol).lock();
            match kind {
                None => {
                    if self.router.series_refcount(&key) > 0 {
                        continue;
                    }
                    let Shard {
                        normalizer,
                        engine,
                        snapshots,
                    } = &mut *guard;
                    normalizer.unregister(&key);
                    let indicators = engine.remove_series(&key);
                    snapshots.remove(&key);
                    if !normalizer.has_symbol(&key.symbol) {
                        self.feed.unsubscribe(&key.symbol);
                    }
                    tracing::info!(series = %key, indicators, "Series torn down");
                    torn_down += 1;
                }
                Some(kind) => {
                    if self.router.indicator_refcount(&key, kind) > 0 {
                        continue;
                    }
                    if guard.engine.unregister(&key, kind) {
                        guard.snapshots.drop_indicator(&key, kind);
                        tracing::debug!(series = %key, indicator = %kind, "Indicator torn down");
                        torn_down += 1;
                    }
                }
            }
        }
        torn_down
    }

    // =========================================================================
    // Data Path
    // =========================================================================

    /// Apply one tick: normalize, update indicators on closed bars, record
    /// snapshots and fan out.
    pub fn process_tick(&self, tick: &Tick) {
        let started = Instant::now();
        let mut guard = self.shard(&tick.symbol).lock();

        match guard.normalizer.on_tick(tick) {
            Err(rejection) => {
                tracing::trace!(symbol = %tick.symbol, reason = rejection.as_str(), "Tick dropped");
                self.stats.record_drop(rejection.into(), 1);
            }
            Ok(normalized) => {
                for (timeframe, rejection) in &normalized.rejected {
                    tracing::trace!(
                        symbol = %tick.symbol,
                        %timeframe,
                        reason = rejection.as_str(),
                        "Tick dropped for timeframe"
                    );
                    self.stats.record_drop((*rejection).into(), 1);
                }
                for (timeframe, _) in &normalized.skipped {
                    self.stats.bar_discontinuities.fetch_add(1, Ordering::Relaxed);
                    metrics::record_bar_discontinuity(*timeframe);
                }
                for bar in &normalized.closed {
                    self.emit_closed(&mut guard, bar);
                }
                for bar in &normalized.updated {
                    self.router.publish_bar(bar);
                }
            }
        }
        drop(guard);

        self.stats.ticks_processed.fetch_add(1, Ordering::Relaxed);
        metrics::record_processing_duration(started.elapsed());
    }

    fn emit_closed(&self, shard: &mut Shard, bar: &Bar) {
        self.stats.bars_closed.fetch_add(1, Ordering::Relaxed);
        if bar.synthesized {
            self.stats.bars_synthesized.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_bar_closed(bar.synthesized);

        let outputs = shard.engine.on_bar_closed(bar);
        for output in &outputs {
            metrics::record_indicator_computation(output.indicator.name());
        }
        self.stats
            .indicator_computations
            .fetch_add(outputs.len() as u64, Ordering::Relaxed);

        shard.snapshots.record(bar, &outputs);
        self.router.publish_bar(bar);
        self.router.publish_indicators(&bar.key(), &outputs);
    }

    /// Close every open bar whose bucket ended at or before `now_ms`.
    ///
    /// Returns the number of bars closed.
    pub fn flush_expired(&self, now_ms: i64) -> usize {
        let mut closed = 0;
        for shard in &self.shards {
            let mut guard = shard.lock();
            let bars = guard.normalizer.close_expired(now_ms);
            for bar in &bars {
                self.emit_closed(&mut guard, bar);
            }
            closed += bars.len();
        }
        closed
    }

    /// Signal a potential gap in the feed (reconnect) to every shard.
    pub fn on_gap(&self) {
        for index in 0..self.shards.len() {
            self.mark_gap(index);
        }
        tracing::info!("Feed gap signalled, next ticks start fresh buckets");
    }

    /// Signal a potential gap to one shard.
    pub fn mark_gap(&self, shard: usize) {
        if let Some(shard) = self.shards.get(shard) {
            shard.lock().normalizer.mark_gap();
        }
    }

    /// Push a feed status change to every subscriber.
    pub fn broadcast_status(&self, state: ConnectionState) {
        let delivered = self.router.broadcast_status(state);
        tracing::debug!(state = %state, delivered, "Feed status pushed");
    }

    // =========================================================================
    // Snapshots and History
    // =========================================================================

    /// Current snapshot of a series, including its open bar.
    ///
    /// Returns `None` if the series is neither normalized nor cached.
    #[must_use]
    pub fn snapshot(&self, key: &SeriesKey) -> Option<Snapshot> {
        let guard = self.shard(&key.symbol).lock();
        if !guard.normalizer.is_registered(key) && guard.snapshots.is_empty(key) {
            return None;
        }
        let mut snapshot = guard.snapshots.get_snapshot(key);
        snapshot.open_bar = guard.normalizer.open_bar(key).cloned();
        Some(snapshot)
    }

    /// Load historical closed bars for a series (oldest first).
    ///
    /// Existing indicator state for the series is rebuilt over the combined
    /// history. Returns the number of bars added.
    ///
    /// # Errors
    ///
    /// Returns an error if the bars are open, unordered, misaligned or
    /// belong to another series.
    pub fn seed_history(&self, key: &SeriesKey, bars: &[Bar]) -> Result<usize, SeedError> {
        let mut guard = self.shard(&key.symbol).lock();
        let added = guard.snapshots.seed(key, bars)?;
        if added > 0 {
            let history = guard.snapshots.bars(key);
            let rebuilt = guard.engine.rebuild(key, &history);
            tracing::info!(series = %key, added, rebuilt, "History seeded");
        }
        Ok(added)
    }

    /// Fetch history from `provider` and seed it.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider fails or its bars are rejected.
    pub async fn backfill(
        &self,
        provider: &dyn HistoryProvider,
        key: &SeriesKey,
    ) -> Result<usize, HistoryError> {
        let bars = provider
            .fetch_bars(key, self.settings.snapshot_capacity)
            .await?;
        Ok(self.seed_history(key, &bars)?)
    }

    /// Hard resync: rebuild every indicator on a series from the snapshot
    /// cache and send fresh snapshots to its subscribers.
    ///
    /// Returns the number of indicators rebuilt.
    pub fn resync(&self, key: &SeriesKey) -> usize {
        let mut guard = self.shard(&key.symbol).lock();
        let Shard {
            normalizer,
            engine,
            snapshots,
        } = &mut *guard;

        let history = snapshots.bars(key);
        let rebuilt = engine.rebuild(key, &history);
        let outputs = engine.snapshot_outputs(key, snapshots.last_bar(key));
        snapshots.set_indicators(key, &outputs);

        for subscriber in self.router.series_subscribers(key) {
            let mut snapshot = snapshots.get_snapshot(key);
            snapshot.retain_indicators(&self.router.subscriber_indicators(subscriber, key));
            snapshot.open_bar = normalizer.open_bar(key).cloned();
            self.router.send_to(subscriber, PushEvent::snapshot(snapshot));
        }
        tracing::info!(series = %key, rebuilt, "Series resynced");
        rebuilt
    }

    /// Status for health reporting.
    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        let series = self
            .shards
            .iter()
            .map(|s| s.lock().normalizer.series_count())
            .sum();
        PipelineStatus {
            stats: self.stats.snapshot(),
            router: self.router.stats(),
            series,
            pending_teardowns: self.pending.lock().len(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::{MockFeedControl, MockHistoryProvider, NoopFeedControl};
    use crate::domain::market::{Timeframe, millis_to_utc};

    const T0: i64 = 1_700_000_100_000;

    fn key() -> SeriesKey {
        SeriesKey::new("BTC-USD", Timeframe::MINUTE)
    }

    fn tick(price: i64, at: i64) -> Tick {
        Tick::new("BTC-USD", Decimal::from(price), Decimal::ONE, millis_to_utc(at))
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(PipelineSettings::default(), Arc::new(NoopFeedControl))
    }

    fn history(count: i64) -> Vec<Bar> {
        (0..count)
            .map(|i| {
                let start = T0 - (count - i) * 60_000;
                Bar {
                    symbol: "BTC-USD".to_string(),
                    timeframe: Timeframe::MINUTE,
                    start_time: millis_to_utc(start),
                    end_time: millis_to_utc(start + 60_000),
                    open: Decimal::from(100 + i),
                    high: Decimal::from(100 + i),
                    low: Decimal::from(100 + i),
                    close: Decimal::from(100 + i),
                    volume: Decimal::ONE,
                    tick_count: 1,
                    closed: true,
                    synthesized: false,
                }
            })
            .collect()
    }

    fn drain(handle: &mut SubscriberHandle) -> Vec<Arc<PushEvent>> {
        std::iter::from_fn(|| handle.events.try_recv()).collect()
    }

    #[test]
    fn attach_sends_snapshot_first() {
        let pipeline = pipeline();
        let mut sub = pipeline.connect();
        pipeline
            .attach(sub.id, &key(), &[IndicatorKind::Sma { period: 2 }])
            .unwrap();
        pipeline.process_tick(&tick(100, T0));

        let events = drain(&mut sub);
        assert_eq!(events[0].kind(), "snapshot");
        assert_eq!(events[1].kind(), "bar");
    }

    #[test]
    fn attach_rejects_invalid_requests() {
        let pipeline = pipeline();
        let sub = pipeline.connect();

        assert_eq!(
            pipeline.attach(sub.id, &SeriesKey::new("", Timeframe::MINUTE), &[]),
            Err(AttachError::EmptySymbol)
        );
        assert!(matches!(
            pipeline.attach(sub.id, &key(), &[IndicatorKind::Sma { period: 0 }]),
            Err(AttachError::Indicator(_))
        ));
        assert_eq!(
            pipeline.attach(999, &key(), &[]),
            Err(AttachError::UnknownSubscriber(999))
        );
    }

    #[test]
    fn first_attach_subscribes_upstream_once() {
        let mut feed = MockFeedControl::new();
        feed.expect_subscribe()
            .with(eq("BTC-USD"))
            .times(1)
            .return_const(());
        let pipeline = Pipeline::new(PipelineSettings::default(), Arc::new(feed));

        let a = pipeline.connect();
        let b = pipeline.connect();
        pipeline.attach(a.id, &key(), &[]).unwrap();
        pipeline.attach(b.id, &key(), &[]).unwrap();
        pipeline
            .attach(a.id, &SeriesKey::new("BTC-USD", Timeframe::FIVE_MINUTES), &[])
            .unwrap();
    }

    #[test]
    fn teardown_waits_for_grace_and_releases_symbol() {
        let mut feed = MockFeedControl::new();
        feed.expect_subscribe().times(1).return_const(());
        feed.expect_unsubscribe()
            .with(eq("BTC-USD"))
            .times(1)
            .return_const(());
        let settings = PipelineSettings {
            grace_period: Duration::from_secs(30),
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline::new(settings, Arc::new(feed));

        let sub = pipeline.connect();
        pipeline
            .attach(sub.id, &key(), &[IndicatorKind::Ema { period: 3 }])
            .unwrap();
        assert!(pipeline.detach(sub.id, &key()));

        assert_eq!(pipeline.sweep(Instant::now()), 0);
        assert_eq!(pipeline.status().series, 1);

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(pipeline.sweep(later), 2);
        assert_eq!(pipeline.status().series, 0);
        assert!(pipeline.snapshot(&key()).is_none());
    }

    #[test]
    fn reattach_within_grace_keeps_state() {
        let pipeline = pipeline();
        let sub = pipeline.connect();
        let sma = IndicatorKind::Sma { period: 2 };
        pipeline.attach(sub.id, &key(), &[sma]).unwrap();
        pipeline.process_tick(&tick(100, T0));
        pipeline.process_tick(&tick(101, T0 + 60_000));
        pipeline.detach(sub.id, &key());

        pipeline.attach(sub.id, &key(), &[sma]).unwrap();
        assert_eq!(pipeline.sweep(Instant::now() + Duration::from_secs(60)), 0);
        assert_eq!(pipeline.snapshot(&key()).unwrap().bars.len(), 1);
    }

    #[test]
    fn fan_out_computes_once() {
        let pipeline = pipeline();
        let kinds = [IndicatorKind::Sma { period: 2 }, IndicatorKind::macd()];
        let mut subs: Vec<SubscriberHandle> = (0..10).map(|_| pipeline.connect()).collect();
        for sub in &subs {
            pipeline.attach(sub.id, &key(), &kinds).unwrap();
        }

        for i in 0..6 {
            pipeline.process_tick(&tick(100 + i, T0 + i * 60_000));
        }

        // 5 closed bars × 2 indicators, independent of subscriber count
        assert_eq!(pipeline.stats().snapshot().indicator_computations, 10);
        for sub in &mut subs {
            let indicator_events = drain(sub)
                .iter()
                .filter(|e| e.kind() == "indicator")
                .count();
            assert_eq!(indicator_events, 10);
        }
    }

    #[test]
    fn unrouted_and_late_ticks_are_counted() {
        let pipeline = pipeline();
        pipeline.process_tick(&tick(100, T0));
        assert_eq!(pipeline.stats().snapshot().dropped_unrouted, 1);

        let sub = pipeline.connect();
        pipeline.attach(sub.id, &key(), &[]).unwrap();
        pipeline.process_tick(&tick(100, T0 + 60_000));
        pipeline.process_tick(&tick(100, T0));
        assert_eq!(pipeline.stats().snapshot().dropped_late, 1);
    }

    #[test]
    fn flush_expired_closes_quiet_series() {
        let pipeline = pipeline();
        let sub = pipeline.connect();
        pipeline.attach(sub.id, &key(), &[]).unwrap();
        pipeline.process_tick(&tick(100, T0));

        assert_eq!(pipeline.flush_expired(T0 + 30_000), 0);
        assert_eq!(pipeline.flush_expired(T0 + 60_000), 1);
        assert_eq!(pipeline.snapshot(&key()).unwrap().bars.len(), 1);
    }

    #[test]
    fn seeded_history_warms_new_indicators() {
        let pipeline = pipeline();
        pipeline.seed_history(&key(), &history(30)).unwrap();

        let mut sub = pipeline.connect();
        pipeline
            .attach(sub.id, &key(), &[IndicatorKind::Sma { period: 20 }])
            .unwrap();

        let events = drain(&mut sub);
        let PushEvent::Snapshot { payload, .. } = events[0].as_ref() else {
            panic!("expected snapshot, got {:?}", events[0]);
        };
        assert_eq!(payload.bars.len(), 30);
        assert!(payload.indicators[0].phase.is_ready());
        assert!(payload.indicators[0].value.is_some());
    }

    #[test]
    fn resync_pushes_fresh_snapshot() {
        let pipeline = pipeline();
        let mut sub = pipeline.connect();
        pipeline
            .attach(sub.id, &key(), &[IndicatorKind::Sma { period: 2 }])
            .unwrap();
        drain(&mut sub);

        assert_eq!(pipeline.resync(&key()), 1);
        let events = drain(&mut sub);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "snapshot");
    }

    #[tokio::test]
    async fn backfill_seeds_from_provider() {
        let pipeline = pipeline();
        let mut provider = MockHistoryProvider::new();
        provider
            .expect_fetch_bars()
            .returning(|_, _| Ok(history(5)));

        let added = pipeline.backfill(&provider, &key()).await.unwrap();

        assert_eq!(added, 5);
        assert_eq!(pipeline.snapshot(&key()).unwrap().bars.len(), 5);
    }

    #[tokio::test]
    async fn backfill_surfaces_provider_errors() {
        let pipeline = pipeline();
        let mut provider = MockHistoryProvider::new();
        provider
            .expect_fetch_bars()
            .returning(|_, _| Err(HistoryError::Unavailable("down".to_string())));

        let result = pipeline.backfill(&provider, &key()).await;

        assert!(matches!(result, Err(HistoryError::Unavailable(_))));
    }

    #[test]
    fn shards_are_stable_per_symbol() {
        let pipeline = pipeline();
        let first = pipeline.shard_index("BTC-USD");
        assert!(first < pipeline.shard_count());
        assert_eq!(pipeline.shard_index("BTC-USD"), first);
    }
}
