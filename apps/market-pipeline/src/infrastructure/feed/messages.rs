//! Feed Wire Messages
//!
//! JSON text frames exchanged with the upstream price feed. A frame holds a
//! single message object or an array of them.
//!
//! # Inbound
//!
//! ```json
//! {"type":"tick","symbol":"BTC-USD","price":"100.5","volume":"0.2","timestamp":1700000000000}
//! {"type":"subscribed","symbols":["BTC-USD"]}
//! {"type":"pong"}
//! {"type":"error","code":400,"message":"unknown symbol"}
//! ```
//!
//! # Outbound
//!
//! ```json
//! {"action":"subscribe","symbols":["BTC-USD"]}
//! {"action":"unsubscribe","symbols":["BTC-USD"]}
//! {"action":"ping"}
//! ```

use chrono::DateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market::Tick;

// =============================================================================
// Inbound
// =============================================================================

/// A trade print from the feed.
///
/// Price and volume accept JSON strings or numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickMessage {
    /// Instrument symbol.
    pub symbol: String,
    /// Traded price.
    pub price: Decimal,
    /// Traded volume.
    #[serde(default)]
    pub volume: Decimal,
    /// Exchange timestamp (epoch milliseconds).
    pub timestamp: i64,
}

impl TickMessage {
    /// Convert to a domain tick.
    ///
    /// Returns `None` if the timestamp is out of range.
    #[must_use]
    pub fn into_tick(self) -> Option<Tick> {
        let timestamp = DateTime::from_timestamp_millis(self.timestamp)?;
        Some(Tick::new(self.symbol, self.price, self.volume, timestamp))
    }
}

/// Subscription confirmation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribedMessage {
    /// Symbols currently streamed.
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Error reported by the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code.
    #[serde(default)]
    pub code: i32,
    /// Description.
    #[serde(default)]
    pub message: String,
}

/// Any inbound feed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// Trade print.
    Tick(TickMessage),
    /// Subscription confirmation.
    Subscribed(SubscribedMessage),
    /// Reply to a ping.
    Pong,
    /// Feed-side error.
    Error(ErrorMessage),
}

// =============================================================================
// Outbound
// =============================================================================

/// Request action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedAction {
    /// Start streaming symbols.
    Subscribe,
    /// Stop streaming symbols.
    Unsubscribe,
    /// Liveness probe.
    Ping,
}

/// Request sent to the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    /// What to do.
    pub action: FeedAction,
    /// Symbols the action applies to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
}

impl FeedRequest {
    /// Subscribe to symbols.
    #[must_use]
    pub const fn subscribe(symbols: Vec<String>) -> Self {
        Self {
            action: FeedAction::Subscribe,
            symbols,
        }
    }

    /// Unsubscribe from symbols.
    #[must_use]
    pub const fn unsubscribe(symbols: Vec<String>) -> Self {
        Self {
            action: FeedAction::Unsubscribe,
            symbols,
        }
    }

    /// Liveness probe.
    #[must_use]
    pub const fn ping() -> Self {
        Self {
            action: FeedAction::Ping,
            symbols: Vec::new(),
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
