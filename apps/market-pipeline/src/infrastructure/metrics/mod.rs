//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ticks**: Received and dropped (by reason)
//! - **Bars**: Closed bars, real and synthesized
//! - **Indicators**: Per-bar indicator computations by kind
//! - **Fan-out**: Push events sent and subscriber updates dropped
//! - **Feed**: Connection state, reconnects, errors
//! - **Latency**: Tick processing time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::market::Timeframe;
use crate::domain::normalizer::TickRejection;
use crate::domain::streaming::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed (another global recorder is
/// already set).
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Tick counters
    describe_counter!(
        "market_pipeline_ticks_received_total",
        "Total ticks received from the upstream feed"
    );
    describe_counter!(
        "market_pipeline_ticks_dropped_total",
        "Total ticks dropped, by reason"
    );

    // Bar and indicator counters
    describe_counter!(
        "market_pipeline_bars_closed_total",
        "Total bars closed, real or synthesized"
    );
    describe_counter!(
        "market_pipeline_bar_discontinuities_total",
        "Total gaps left unfilled because they exceeded the synthesis cap"
    );
    describe_counter!(
        "market_pipeline_indicator_computations_total",
        "Total per-bar indicator updates, by indicator"
    );

    // Fan-out
    describe_counter!(
        "market_pipeline_push_events_total",
        "Total push events enqueued to subscribers, by event type"
    );
    describe_counter!(
        "market_pipeline_subscriber_updates_dropped_total",
        "Total subscriber updates dropped due to slow consumers"
    );
    describe_gauge!(
        "market_pipeline_subscribers",
        "Number of connected subscribers"
    );
    describe_gauge!(
        "market_pipeline_active_series",
        "Number of series with at least one subscriber"
    );

    // Feed connection
    describe_gauge!(
        "market_pipeline_feed_state",
        "Feed state (0=disconnected, 1=connecting, 2=connected, 3=degraded)"
    );
    describe_counter!(
        "market_pipeline_reconnects_total",
        "Total feed reconnection attempts"
    );
    describe_counter!(
        "market_pipeline_feed_errors_total",
        "Total feed errors by type"
    );

    // Latency histograms
    describe_histogram!(
        "market_pipeline_tick_processing_seconds",
        "Time to normalize a tick, update indicators and fan out"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Why a tick was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Tick queue overflowed and evicted the oldest tick.
    QueueOverflow,
    /// A shard worker's channel was full.
    ShardOverflow,
    /// Bucket already closed.
    Late,
    /// Earlier than the last accepted tick in the same bucket.
    OutOfOrder,
    /// Undecodable frame or invalid tick fields.
    Malformed,
    /// No series registered for the symbol.
    Unrouted,
}

impl DropReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueOverflow => "queue_overflow",
            Self::ShardOverflow => "shard_overflow",
            Self::Late => "late",
            Self::OutOfOrder => "out_of_order",
            Self::Malformed => "malformed",
            Self::Unrouted => "unrouted",
        }
    }
}

impl From<TickRejection> for DropReason {
    fn from(rejection: TickRejection) -> Self {
        match rejection {
            TickRejection::Malformed => Self::Malformed,
            TickRejection::Unrouted => Self::Unrouted,
            TickRejection::Late => Self::Late,
            TickRejection::OutOfOrder => Self::OutOfOrder,
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a tick received from the feed.
pub fn record_tick_received() {
    counter!("market_pipeline_ticks_received_total").increment(1);
}

/// Record dropped ticks.
pub fn record_ticks_dropped(reason: DropReason, count: u64) {
    counter!(
        "market_pipeline_ticks_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(count);
}

/// Record a closed bar.
pub fn record_bar_closed(synthesized: bool) {
    counter!(
        "market_pipeline_bars_closed_total",
        "kind" => if synthesized { "synthesized" } else { "real" }
    )
    .increment(1);
}

/// Record a gap that was too large to fill with synthesized bars.
pub fn record_bar_discontinuity(timeframe: Timeframe) {
    counter!(
        "market_pipeline_bar_discontinuities_total",
        "timeframe" => timeframe.to_string()
    )
    .increment(1);
}

/// Record one indicator update.
pub fn record_indicator_computation(indicator: &'static str) {
    counter!(
        "market_pipeline_indicator_computations_total",
        "indicator" => indicator
    )
    .increment(1);
}

/// Record push events enqueued to subscribers.
pub fn record_push_events(event: &'static str, count: u64) {
    counter!(
        "market_pipeline_push_events_total",
        "event" => event
    )
    .increment(count);
}

/// Record subscriber updates dropped due to a full buffer.
pub fn record_subscriber_drops(count: u64) {
    counter!("market_pipeline_subscriber_updates_dropped_total").increment(count);
}

/// Update the connected subscriber count.
pub fn set_subscribers(count: f64) {
    gauge!("market_pipeline_subscribers").set(count);
}

/// Update the active series count.
pub fn set_active_series(count: f64) {
    gauge!("market_pipeline_active_series").set(count);
}

/// Update the feed state gauge.
pub fn set_feed_state(state: ConnectionState) {
    gauge!("market_pipeline_feed_state").set(state.gauge_value());
}

/// Record a feed reconnection attempt.
pub fn record_reconnect() {
    counter!("market_pipeline_reconnects_total").increment(1);
}

/// Record a feed error.
pub fn record_feed_error(error_type: &str) {
    counter!(
        "market_pipeline_feed_errors_total",
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record tick processing duration.
pub fn record_processing_duration(duration: Duration) {
    histogram!("market_pipeline_tick_processing_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
