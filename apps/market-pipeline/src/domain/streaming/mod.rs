//! Push Event Types
//!
//! Typed events fanned out to subscribers and the feed connection state
//! they may carry. These are the canonical outbound representation; the
//! push server serializes them to JSON unchanged.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {"type": "bar", "symbol": "BTC-USD", "timeframe": "1m", "payload": {...}}
//! {"type": "indicator", "symbol": "BTC-USD", "timeframe": "1m", "payload": {...}}
//! {"type": "snapshot", "symbol": "BTC-USD", "timeframe": "1m", "payload": {...}}
//! {"type": "status", "payload": {"state": "connected"}}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use super::indicators::IndicatorOutput;
use super::market::{Bar, SeriesKey, Symbol, Timeframe};
use super::snapshot::Snapshot;

// =============================================================================
// Connection State
// =============================================================================

/// Upstream feed connection state.
///
/// `Disconnected → Connecting → Connected → Degraded → Connecting …`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected; initial state.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected and receiving data.
    Connected,
    /// Connection lost; waiting out a backoff delay before retrying.
    Degraded {
        /// Reconnection attempt number.
        attempt: u32,
        /// Backoff delay before the next attempt.
        retry_in_ms: u64,
    },
}

impl ConnectionState {
    /// Short state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded { .. } => "degraded",
        }
    }

    /// Numeric value for the feed state gauge.
    #[must_use]
    pub const fn gauge_value(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Degraded { .. } => 3.0,
        }
    }

    /// Whether the feed is delivering data.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Push Events
// =============================================================================

/// Snapshot payload: history then current state of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    /// Closed bars, oldest first.
    pub bars: Vec<Bar>,
    /// Latest value of each requested indicator.
    pub indicators: Vec<IndicatorOutput>,
    /// Bar currently being built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_bar: Option<Bar>,
}

/// Event delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// A bar update; `payload.closed` tells open updates from closes.
    Bar {
        /// Instrument symbol.
        symbol: Symbol,
        /// Bucket length.
        timeframe: Timeframe,
        /// The bar.
        payload: Bar,
    },
    /// An indicator update after a bar close.
    Indicator {
        /// Instrument symbol.
        symbol: Symbol,
        /// Bucket length.
        timeframe: Timeframe,
        /// The update.
        payload: IndicatorOutput,
    },
    /// Initial state sent on attach, before any live update.
    Snapshot {
        /// Instrument symbol.
        symbol: Symbol,
        /// Bucket length.
        timeframe: Timeframe,
        /// History and latest values.
        payload: SnapshotPayload,
    },
    /// Upstream feed status change.
    Status {
        /// New state.
        payload: ConnectionState,
    },
    /// A subscriber command was rejected.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl PushEvent {
    /// Bar event.
    #[must_use]
    pub fn bar(bar: &Bar) -> Self {
        Self::Bar {
            symbol: bar.symbol.clone(),
            timeframe: bar.timeframe,
            payload: bar.clone(),
        }
    }

    /// Indicator event.
    #[must_use]
    pub fn indicator(key: &SeriesKey, output: IndicatorOutput) -> Self {
        Self::Indicator {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            payload: output,
        }
    }

    /// Snapshot event.
    #[must_use]
    pub fn snapshot(snapshot: Snapshot) -> Self {
        Self::Snapshot {
            symbol: snapshot.symbol,
            timeframe: snapshot.timeframe,
            payload: SnapshotPayload {
                bars: snapshot.bars,
                indicators: snapshot.indicators,
                open_bar: snapshot.open_bar,
            },
        }
    }

    /// Status event.
    #[must_use]
    pub const fn status(state: ConnectionState) -> Self {
        Self::Status { payload: state }
    }

    /// Error event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Event type name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bar { .. } => "bar",
            Self::Indicator { .. } => "indicator",
            Self::Snapshot { .. } => "snapshot",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
        }
    }

    /// Series this event belongs to, if any.
    #[must_use]
    pub fn series(&self) -> Option<SeriesKey> {
        match self {
            Self::Bar {
                symbol, timeframe, ..
            }
            | Self::Indicator {
                symbol, timeframe, ..
            }
            | Self::Snapshot {
                symbol, timeframe, ..
            } => Some(SeriesKey::new(symbol.clone(), *timeframe)),
            Self::Status { .. } | Self::Error { .. } => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
