//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedControl`: Upstream symbol subscriptions on the price feed
//! - `HistoryProvider`: External historical bar query for cold start

use async_trait::async_trait;

use crate::domain::market::{Bar, SeriesKey};
use crate::domain::snapshot::SeedError;

/// Controls which symbols the upstream feed delivers.
///
/// Calls must not block; the connector applies them asynchronously and
/// replays the full set after every reconnect.
#[cfg_attr(test, mockall::automock)]
pub trait FeedControl: Send + Sync {
    /// Start receiving ticks for `symbol`.
    fn subscribe(&self, symbol: &str);

    /// Stop receiving ticks for `symbol`.
    fn unsubscribe(&self, symbol: &str);
}

/// Feed control that ignores every request.
///
/// For pipelines driven directly with ticks (replays, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFeedControl;

impl FeedControl for NoopFeedControl {
    fn subscribe(&self, _symbol: &str) {}

    fn unsubscribe(&self, _symbol: &str) {}
}

/// Errors from a historical bar query.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The history source could not answer.
    #[error("history unavailable: {0}")]
    Unavailable(String),

    /// The returned bars were rejected by the snapshot cache.
    #[error("invalid history: {0}")]
    Invalid(#[from] SeedError),
}

/// External source of historical closed bars.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Fetch up to `limit` of the most recent closed bars for a series,
    /// oldest first.
    async fn fetch_bars(&self, key: &SeriesKey, limit: usize) -> Result<Vec<Bar>, HistoryError>;
}
