//! Subscription Router
//!
//! Tracks subscriber interest and fans out exactly the updates each
//! subscriber needs. Every event is built once and shared by `Arc`; each
//! subscriber has its own bounded drop-oldest queue so a slow subscriber
//! only ever loses its own oldest updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::queue::{QueueReceiver, QueueSender, drop_oldest};
use crate::domain::indicators::{IndicatorKind, IndicatorOutput};
use crate::domain::market::{Bar, SeriesKey};
use crate::domain::streaming::{ConnectionState, PushEvent};
use crate::domain::subscription::{InterestChanges, InterestIndex, InterestStats, SubscriberId};
use crate::infrastructure::metrics;

/// Default per-subscriber queue capacity.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// A connected subscriber's end of its outbound queue.
#[derive(Debug)]
pub struct SubscriberHandle {
    /// Assigned subscriber id.
    pub id: SubscriberId,
    /// Outbound events, oldest dropped on overflow.
    pub events: QueueReceiver<Arc<PushEvent>>,
}

/// Router statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RouterStats {
    /// Connected subscribers (with or without attachments).
    pub connected: usize,
    /// Interest index counts.
    #[serde(flatten)]
    pub interest: InterestStats,
    /// Updates dropped across all subscriber queues.
    pub updates_dropped: u64,
}

/// Fan-out of push events to interested subscribers.
pub struct SubscriptionRouter {
    interest: RwLock<InterestIndex>,
    queues: RwLock<HashMap<SubscriberId, QueueSender<Arc<PushEvent>>>>,
    next_id: AtomicU64,
    buffer: usize,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for SubscriptionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRouter")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl SubscriptionRouter {
    /// Create a router whose subscriber queues hold `buffer` events.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            interest: RwLock::new(InterestIndex::new()),
            queues: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a new subscriber and open its outbound queue.
    pub fn connect(&self) -> SubscriberHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = drop_oldest(self.buffer);
        let dropped = Arc::clone(&self.dropped);
        let events = rx.on_drop(move |n| {
            dropped.fetch_add(n, Ordering::Relaxed);
            metrics::record_subscriber_drops(n);
            tracing::debug!(
                subscriber_id = id,
                dropped = n,
                "Subscriber lagging, dropped oldest updates"
            );
        });

        let connected = {
            let mut queues = self.queues.write();
            queues.insert(id, tx);
            queues.len()
        };
        #[allow(clippy::cast_precision_loss)]
        metrics::set_subscribers(connected as f64);
        tracing::debug!(subscriber_id = id, "Subscriber connected");

        SubscriberHandle { id, events }
    }

    /// Whether a subscriber is connected.
    #[must_use]
    pub fn is_connected(&self, subscriber: SubscriberId) -> bool {
        self.queues.read().contains_key(&subscriber)
    }

    /// Record interest of a connected subscriber.
    ///
    /// Returns `None` if the subscriber is not connected.
    pub fn attach(
        &self,
        subscriber: SubscriberId,
        key: &SeriesKey,
        indicators: &[IndicatorKind],
    ) -> Option<InterestChanges> {
        if !self.is_connected(subscriber) {
            return None;
        }
        let changes = self.interest.write().attach(subscriber, key, indicators);
        self.update_series_gauge();
        Some(changes)
    }

    /// Remove a subscriber's interest in a series.
    ///
    /// Returns `None` if the subscriber was not attached to it.
    pub fn detach(&self, subscriber: SubscriberId, key: &SeriesKey) -> Option<InterestChanges> {
        let changes = {
            let mut interest = self.interest.write();
            if !interest.subscriber_series(subscriber).contains(key) {
                return None;
            }
            interest.detach(subscriber, key)
        };
        self.update_series_gauge();
        Some(changes)
    }

    /// Remove a subscriber entirely, closing its queue.
    ///
    /// Returns the interest changes per series it was attached to.
    pub fn disconnect(&self, subscriber: SubscriberId) -> Vec<(SeriesKey, InterestChanges)> {
        let changes = self.interest.write().disconnect(subscriber);
        let connected = {
            let mut queues = self.queues.write();
            queues.remove(&subscriber);
            queues.len()
        };
        #[allow(clippy::cast_precision_loss)]
        metrics::set_subscribers(connected as f64);
        self.update_series_gauge();
        tracing::debug!(
            subscriber_id = subscriber,
            series = changes.len(),
            "Subscriber disconnected"
        );
        changes
    }

    /// Enqueue an event for one subscriber.
    pub fn send_to(&self, subscriber: SubscriberId, event: PushEvent) -> bool {
        let kind = event.kind();
        let sent = self
            .queues
            .read()
            .get(&subscriber)
            .is_some_and(|tx| tx.push(Arc::new(event)));
        if sent {
            metrics::record_push_events(kind, 1);
        }
        sent
    }

    /// Fan a bar (open or closed) out to the series' subscribers.
    ///
    /// Returns the number of subscribers it was enqueued for.
    pub fn publish_bar(&self, bar: &Bar) -> usize {
        let subscribers = self.interest.read().series_subscribers(&bar.key());
        if subscribers.is_empty() {
            return 0;
        }
        self.deliver(&subscribers, &Arc::new(PushEvent::bar(bar)))
    }

    /// Fan indicator updates out to the subscribers of each indicator.
    ///
    /// Returns the total number of enqueued events.
    pub fn publish_indicators(&self, key: &SeriesKey, outputs: &[IndicatorOutput]) -> usize {
        let mut delivered = 0;
        for output in outputs {
            let subscribers = self.interest.read().indicator_subscribers(key, output.indicator);
            if subscribers.is_empty() {
                continue;
            }
            let event = Arc::new(PushEvent::indicator(key, output.clone()));
            delivered += self.deliver(&subscribers, &event);
        }
        delivered
    }

    /// Push a feed status change to every connected subscriber.
    pub fn broadcast_status(&self, state: ConnectionState) -> usize {
        let event = Arc::new(PushEvent::status(state));
        let queues = self.queues.read();
        let delivered = queues
            .values()
            .filter(|tx| tx.push(Arc::clone(&event)))
            .count();
        metrics::record_push_events("status", delivered as u64);
        delivered
    }

    fn deliver(&self, subscribers: &[SubscriberId], event: &Arc<PushEvent>) -> usize {
        let queues = self.queues.read();
        let delivered = subscribers
            .iter()
            .filter_map(|id| queues.get(id))
            .filter(|tx| tx.push(Arc::clone(event)))
            .count();
        metrics::record_push_events(event.kind(), delivered as u64);
        delivered
    }

    /// Number of subscribers on a series.
    #[must_use]
    pub fn series_refcount(&self, key: &SeriesKey) -> usize {
        self.interest.read().series_refcount(key)
    }

    /// Number of subscribers wanting an indicator on a series.
    #[must_use]
    pub fn indicator_refcount(&self, key: &SeriesKey, kind: IndicatorKind) -> usize {
        self.interest.read().indicator_refcount(key, kind)
    }

    /// Subscribers attached to a series.
    #[must_use]
    pub fn series_subscribers(&self, key: &SeriesKey) -> Vec<SubscriberId> {
        self.interest.read().series_subscribers(key)
    }

    /// Indicators a subscriber wants on a series.
    #[must_use]
    pub fn subscriber_indicators(
        &self,
        subscriber: SubscriberId,
        key: &SeriesKey,
    ) -> Vec<IndicatorKind> {
        self.interest.read().subscriber_indicators(subscriber, key)
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            connected: self.queues.read().len(),
            interest: self.interest.read().stats(),
            updates_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn update_series_gauge(&self) {
        #[allow(clippy::cast_precision_loss)]
        metrics::set_active_series(self.interest.read().stats().series_count as f64);
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::indicators::{IndicatorPhase, IndicatorValue};
    use crate::domain::market::{Timeframe, millis_to_utc};

    const SMA: IndicatorKind = IndicatorKind::Sma { period: 2 };
    const EMA: IndicatorKind = IndicatorKind::Ema { period: 2 };

    fn key() -> SeriesKey {
        SeriesKey::new("BTC-USD", Timeframe::MINUTE)
    }

    fn bar(i: i64) -> Bar {
        Bar {
            symbol: "BTC-USD".to_string(),
            timeframe: Timeframe::MINUTE,
            start_time: millis_to_utc(i * 60_000),
            end_time: millis_to_utc((i + 1) * 60_000),
            open: Decimal::ONE,
            high: Decimal::ONE,
            low: Decimal::ONE,
            close: Decimal::ONE,
            volume: Decimal::ONE,
            tick_count: 1,
            closed: true,
            synthesized: false,
        }
    }

    fn output(kind: IndicatorKind) -> IndicatorOutput {
        IndicatorOutput {
            indicator: kind,
            time: millis_to_utc(60_000),
            phase: IndicatorPhase::Ready,
            value: Some(IndicatorValue::Sma { value: 1.0 }),
        }
    }

    #[test]
    fn attach_requires_connection() {
        let router = SubscriptionRouter::default();
        assert!(router.attach(42, &key(), &[SMA]).is_none());

        let handle = router.connect();
        assert!(router.attach(handle.id, &key(), &[SMA]).is_some());
    }

    #[test]
    fn indicator_events_reach_only_interested() {
        let router = SubscriptionRouter::default();
        let mut a = router.connect();
        let mut b = router.connect();
        router.attach(a.id, &key(), &[SMA]);
        router.attach(b.id, &key(), &[EMA]);

        let delivered = router.publish_indicators(&key(), &[output(SMA)]);

        assert_eq!(delivered, 1);
        assert!(matches!(
            a.events.try_recv().as_deref(),
            Some(PushEvent::Indicator { .. })
        ));
        assert!(b.events.try_recv().is_none());
    }

    #[test]
    fn bar_events_are_shared() {
        let router = SubscriptionRouter::default();
        let mut a = router.connect();
        let mut b = router.connect();
        router.attach(a.id, &key(), &[]);
        router.attach(b.id, &key(), &[]);

        assert_eq!(router.publish_bar(&bar(0)), 2);

        let ea = a.events.try_recv().unwrap();
        let eb = b.events.try_recv().unwrap();
        assert!(Arc::ptr_eq(&ea, &eb));
    }

    #[test]
    fn slow_subscriber_drops_only_its_own() {
        let router = SubscriptionRouter::new(2);
        let mut slow = router.connect();
        let mut fast = router.connect();
        router.attach(slow.id, &key(), &[]);
        router.attach(fast.id, &key(), &[]);

        for i in 0..5 {
            router.publish_bar(&bar(i));
            assert!(fast.events.try_recv().is_some());
        }

        let first = slow.events.try_recv().unwrap();
        assert_eq!(first.series(), Some(key()));
        assert_eq!(slow.events.dropped(), 3);
        assert_eq!(fast.events.dropped(), 0);
        assert_eq!(router.stats().updates_dropped, 3);
    }

    #[test]
    fn status_goes_to_everyone() {
        let router = SubscriptionRouter::default();
        let mut a = router.connect();
        let mut b = router.connect();
        router.attach(a.id, &key(), &[]);

        assert_eq!(router.broadcast_status(ConnectionState::Connected), 2);
        assert!(a.events.try_recv().is_some());
        assert!(b.events.try_recv().is_some());
    }

    #[tokio::test]
    async fn disconnect_closes_queue() {
        let router = SubscriptionRouter::default();
        let mut handle = router.connect();
        router.attach(handle.id, &key(), &[SMA]);

        let changes = router.disconnect(handle.id);

        assert_eq!(changes.len(), 1);
        assert!(changes[0].1.series_released);
        assert!(!router.is_connected(handle.id));
        assert!(handle.events.recv().await.is_none());
    }

    #[test]
    fn detach_unknown_returns_none() {
        let router = SubscriptionRouter::default();
        let handle = router.connect();
        assert!(router.detach(handle.id, &key()).is_none());
    }
}
