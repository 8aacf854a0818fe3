//! Market Data Types
//!
//! Canonical internal representation of ticks, bars and timeframes.
//! Prices and volumes stay in `Decimal` so bar volume is the exact sum
//! of its ticks; indicator math converts closes to `f64`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// A symbol string (e.g. `BTC-USD`).
pub type Symbol = String;

// =============================================================================
// Timeframe
// =============================================================================

/// Fixed bucket length for bar aggregation.
///
/// Parsed from and displayed as compact strings: `30s`, `1m`, `5m`, `1h`, `1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    millis: i64,
}

impl Timeframe {
    /// One second.
    pub const SECOND: Self = Self { millis: 1_000 };
    /// One minute.
    pub const MINUTE: Self = Self { millis: 60_000 };
    /// Five minutes.
    pub const FIVE_MINUTES: Self = Self { millis: 300_000 };
    /// One hour.
    pub const HOUR: Self = Self { millis: 3_600_000 };
    /// One day.
    pub const DAY: Self = Self { millis: 86_400_000 };
    /// Longest accepted bucket, one week.
    pub const MAX: Self = Self {
        millis: 7 * 86_400_000,
    };

    /// Create a timeframe from a length in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if `millis` is not positive or longer than
    /// [`Timeframe::MAX`].
    pub const fn from_millis(millis: i64) -> Result<Self, TimeframeError> {
        if millis <= 0 {
            return Err(TimeframeError::NonPositive(millis));
        }
        if millis > Self::MAX.millis {
            return Err(TimeframeError::TooLong(millis));
        }
        Ok(Self { millis })
    }

    /// Bucket length in milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.millis
    }

    /// Start of the bucket containing `timestamp_ms`.
    ///
    /// Uses floor division so pre-epoch timestamps land in the right bucket.
    #[must_use]
    pub const fn bucket_start(self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.millis) * self.millis
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(i64, &str); 4] = [
            (86_400_000, "d"),
            (3_600_000, "h"),
            (60_000, "m"),
            (1_000, "s"),
        ];

        for (unit, suffix) in UNITS {
            if self.millis % unit == 0 {
                return write!(f, "{}{suffix}", self.millis / unit);
            }
        }
        write!(f, "{}ms", self.millis)
    }
}

impl FromStr for Timeframe {
    type Err = TimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| TimeframeError::Invalid(s.to_string()))?;
        let (count, unit) = trimmed.split_at(split);

        let count: i64 = count
            .parse()
            .map_err(|_| TimeframeError::Invalid(s.to_string()))?;

        let unit_millis = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return Err(TimeframeError::Invalid(s.to_string())),
        };

        let millis = count
            .checked_mul(unit_millis)
            .ok_or_else(|| TimeframeError::Invalid(s.to_string()))?;
        Self::from_millis(millis)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = TimeframeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.to_string()
    }
}

/// Timeframe parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeframeError {
    /// Not of the form `<count><unit>`.
    #[error("invalid timeframe: {0}")]
    Invalid(String),
    /// Zero or negative length.
    #[error("timeframe must be positive, got {0}ms")]
    NonPositive(i64),
    /// Longer than [`Timeframe::MAX`].
    #[error("timeframe must be at most 7d, got {0}ms")]
    TooLong(i64),
}

// =============================================================================
// Series Key
// =============================================================================

/// Identifies one bar series: a symbol at a timeframe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Bucket length.
    pub timeframe: Timeframe,
}

impl SeriesKey {
    /// Create a new series key.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// =============================================================================
// Tick
// =============================================================================

/// A single raw price/volume observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Traded price.
    pub price: Decimal,
    /// Traded volume.
    pub volume: Decimal,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// Create a new tick.
    #[must_use]
    pub fn new(
        symbol: impl Into<Symbol>,
        price: Decimal,
        volume: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume,
            timestamp,
        }
    }

    /// Timestamp in epoch milliseconds.
    #[must_use]
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

// =============================================================================
// Bar
// =============================================================================

/// Aggregated OHLCV summary for one symbol over one time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Bucket length.
    pub timeframe: Timeframe,
    /// Bucket start (inclusive).
    pub start_time: DateTime<Utc>,
    /// Bucket end (exclusive).
    pub end_time: DateTime<Utc>,
    /// First price in the bucket.
    pub open: Decimal,
    /// Highest price in the bucket.
    pub high: Decimal,
    /// Lowest price in the bucket.
    pub low: Decimal,
    /// Last price in the bucket.
    pub close: Decimal,
    /// Sum of tick volumes.
    pub volume: Decimal,
    /// Number of ticks aggregated.
    pub tick_count: u64,
    /// Whether the bucket is finished. Closed bars are immutable.
    pub closed: bool,
    /// Whether this bar was synthesized to fill an empty bucket.
    pub synthesized: bool,
}

impl Bar {
    /// Series this bar belongs to.
    #[must_use]
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.timeframe)
    }

    /// Bucket start in epoch milliseconds.
    #[must_use]
    pub fn start_millis(&self) -> i64 {
        self.start_time.timestamp_millis()
    }

    /// Bucket end in epoch milliseconds.
    #[must_use]
    pub fn end_millis(&self) -> i64 {
        self.end_time.timestamp_millis()
    }

    /// Close as `f64` for indicator math.
    ///
    /// Decimals always fit in `f64` range, so the fallback is unreachable
    /// in practice.
    #[must_use]
    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or_default()
    }
}

/// Convert epoch milliseconds to a UTC timestamp, clamping out-of-range values.
#[must_use]
pub fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
