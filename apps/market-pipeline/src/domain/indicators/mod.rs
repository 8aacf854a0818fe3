//! Technical Indicators
//!
//! Incremental indicator state updated once per closed bar.
//!
//! Each indicator kind is a variant of the closed [`IndicatorKind`] sum type
//! with its own parameters, and produces its own [`IndicatorValue`] shape.
//! State transitions `Warming → Ready` once its window fills and never goes
//! back; only an explicit rebuild replaces it.

mod bollinger;
mod ema;
mod engine;
mod macd;
mod rsi;
mod sma;

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use bollinger::Bollinger;
pub use ema::Ema;
pub use engine::IndicatorEngine;
pub use macd::Macd;
pub use rsi::Rsi;
pub use sma::Sma;

/// Default MACD fast period.
pub const MACD_FAST: usize = 12;
/// Default MACD slow period.
pub const MACD_SLOW: usize = 26;
/// Default MACD signal period.
pub const MACD_SIGNAL: usize = 9;
/// Default Bollinger window.
pub const BOLLINGER_PERIOD: usize = 20;
/// Default Bollinger band width in standard deviations.
pub const BOLLINGER_MULTIPLIER: f64 = 2.0;
/// Largest accepted window for any indicator period.
pub const MAX_PERIOD: usize = 10_000;

const fn default_macd_fast() -> usize {
    MACD_FAST
}
const fn default_macd_slow() -> usize {
    MACD_SLOW
}
const fn default_macd_signal() -> usize {
    MACD_SIGNAL
}
const fn default_bollinger_period() -> usize {
    BOLLINGER_PERIOD
}
const fn default_bollinger_multiplier() -> f64 {
    BOLLINGER_MULTIPLIER
}

// =============================================================================
// Indicator Kind
// =============================================================================

/// An indicator and its parameters.
///
/// # Wire Format (JSON)
/// ```json
/// {"kind": "sma", "period": 20}
/// {"kind": "macd"}
/// {"kind": "bollinger", "period": 20, "multiplier": 2.0}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndicatorKind {
    /// Simple moving average of closes.
    Sma {
        /// Window length.
        period: usize,
    },
    /// Exponential moving average of closes, seeded with an SMA.
    Ema {
        /// Smoothing length.
        period: usize,
    },
    /// Wilder's relative strength index.
    Rsi {
        /// Smoothing length.
        period: usize,
    },
    /// Moving average convergence/divergence.
    Macd {
        /// Fast EMA length.
        #[serde(default = "default_macd_fast")]
        fast: usize,
        /// Slow EMA length.
        #[serde(default = "default_macd_slow")]
        slow: usize,
        /// Signal EMA length.
        #[serde(default = "default_macd_signal")]
        signal: usize,
    },
    /// Bollinger bands around an SMA.
    Bollinger {
        /// Window length.
        #[serde(default = "default_bollinger_period")]
        period: usize,
        /// Band width in population standard deviations.
        #[serde(default = "default_bollinger_multiplier")]
        multiplier: f64,
    },
}

impl IndicatorKind {
    /// MACD with the standard 12/26/9 parameters.
    #[must_use]
    pub const fn macd() -> Self {
        Self::Macd {
            fast: MACD_FAST,
            slow: MACD_SLOW,
            signal: MACD_SIGNAL,
        }
    }

    /// Bollinger bands with the standard 20/2 parameters.
    #[must_use]
    pub const fn bollinger() -> Self {
        Self::Bollinger {
            period: BOLLINGER_PERIOD,
            multiplier: BOLLINGER_MULTIPLIER,
        }
    }

    /// Short name, used as a metric label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sma { .. } => "sma",
            Self::Ema { .. } => "ema",
            Self::Rsi { .. } => "rsi",
            Self::Macd { .. } => "macd",
            Self::Bollinger { .. } => "bollinger",
        }
    }

    /// Number of closed bars needed before the indicator is ready.
    #[must_use]
    pub const fn warmup_bars(&self) -> usize {
        match *self {
            Self::Sma { period } | Self::Ema { period } | Self::Bollinger { period, .. } => period,
            Self::Rsi { period } => period.saturating_add(1),
            Self::Macd { slow, signal, .. } => slow.saturating_add(signal).saturating_sub(1),
        }
    }

    /// Check the parameters.
    ///
    /// # Errors
    ///
    /// Returns an error for periods outside `1..=MAX_PERIOD`, a MACD fast
    /// period that is not shorter than the slow one, or a non-positive
    /// Bollinger multiplier.
    pub fn validate(&self) -> Result<(), IndicatorError> {
        match *self {
            Self::Sma { period } | Self::Ema { period } | Self::Rsi { period } => {
                check_period(self.name(), period)
            }
            Self::Macd { fast, slow, signal } => {
                check_period("macd", fast)?;
                check_period("macd", slow)?;
                check_period("macd", signal)?;
                if fast >= slow {
                    return Err(IndicatorError::MacdPeriods { fast, slow });
                }
                Ok(())
            }
            Self::Bollinger { period, multiplier } => {
                check_period("bollinger", period)?;
                if !multiplier.is_finite() || multiplier <= 0.0 {
                    return Err(IndicatorError::Multiplier(multiplier));
                }
                Ok(())
            }
        }
    }
}

fn check_period(kind: &'static str, period: usize) -> Result<(), IndicatorError> {
    if period == 0 || period > MAX_PERIOD {
        return Err(IndicatorError::Period { kind, period });
    }
    Ok(())
}

// Parameters are validated finite before use, so bitwise equality of the
// multiplier agrees with `PartialEq`.
impl Eq for IndicatorKind {}

impl Hash for IndicatorKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match *self {
            Self::Sma { period } | Self::Ema { period } | Self::Rsi { period } => {
                period.hash(state);
            }
            Self::Macd { fast, slow, signal } => {
                fast.hash(state);
                slow.hash(state);
                signal.hash(state);
            }
            Self::Bollinger { period, multiplier } => {
                period.hash(state);
                multiplier.to_bits().hash(state);
            }
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sma { period } | Self::Ema { period } | Self::Rsi { period } => {
                write!(f, "{}({period})", self.name())
            }
            Self::Macd { fast, slow, signal } => write!(f, "macd({fast},{slow},{signal})"),
            Self::Bollinger { period, multiplier } => {
                write!(f, "bollinger({period},{multiplier})")
            }
        }
    }
}

/// Invalid indicator parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndicatorError {
    /// A period was zero or larger than [`MAX_PERIOD`].
    #[error("{kind} period must be between 1 and {MAX_PERIOD}, got {period}")]
    Period {
        /// Indicator name.
        kind: &'static str,
        /// Offending period.
        period: usize,
    },
    /// MACD fast period must be shorter than the slow one.
    #[error("macd fast period {fast} must be less than slow period {slow}")]
    MacdPeriods {
        /// Fast period.
        fast: usize,
        /// Slow period.
        slow: usize,
    },
    /// Bollinger multiplier must be finite and positive.
    #[error("bollinger multiplier must be finite and positive, got {0}")]
    Multiplier(f64),
}

// =============================================================================
// Values and Phases
// =============================================================================

/// Output of one indicator for one closed bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndicatorValue {
    /// Simple moving average.
    Sma {
        /// Average close.
        value: f64,
    },
    /// Exponential moving average.
    Ema {
        /// Smoothed close.
        value: f64,
    },
    /// Relative strength index in `[0, 100]`.
    Rsi {
        /// Oscillator value.
        value: f64,
    },
    /// MACD line, signal line and histogram.
    Macd {
        /// Fast EMA minus slow EMA.
        macd: f64,
        /// EMA of the MACD line.
        signal: f64,
        /// `macd - signal`.
        histogram: f64,
    },
    /// Bollinger envelope.
    Bollinger {
        /// SMA of closes.
        middle: f64,
        /// `middle + k*σ`.
        upper: f64,
        /// `middle - k*σ`.
        lower: f64,
    },
}

/// Lifecycle of an indicator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum IndicatorPhase {
    /// Window not yet filled.
    Warming {
        /// Bars observed so far.
        observed: usize,
        /// Bars needed.
        required: usize,
    },
    /// Producing values.
    Ready,
}

impl IndicatorPhase {
    /// Whether the indicator is producing values.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Indicator update pushed downstream after a bar closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorOutput {
    /// Which indicator.
    pub indicator: IndicatorKind,
    /// End time of the bar that produced this update.
    pub time: DateTime<Utc>,
    /// Warming progress or ready.
    pub phase: IndicatorPhase,
    /// Latest value; `None` while warming.
    pub value: Option<IndicatorValue>,
}

// =============================================================================
// Indicator Trait and State
// =============================================================================

/// Incremental indicator fed one close per bar.
pub trait Indicator {
    /// Feed the close of a newly closed bar.
    ///
    /// Returns the new value once ready.
    fn update(&mut self, close: f64) -> Option<IndicatorValue>;

    /// Latest value, if ready.
    fn value(&self) -> Option<IndicatorValue>;

    /// Current lifecycle phase.
    fn phase(&self) -> IndicatorPhase;
}

/// Warming/ready phase from an observation count.
pub(crate) const fn phase_for(observed: usize, required: usize) -> IndicatorPhase {
    if observed >= required {
        IndicatorPhase::Ready
    } else {
        IndicatorPhase::Warming { observed, required }
    }
}

/// Rolling state for one indicator kind.
#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorState {
    /// SMA state.
    Sma(Sma),
    /// EMA state.
    Ema(Ema),
    /// RSI state.
    Rsi(Rsi),
    /// MACD state.
    Macd(Macd),
    /// Bollinger state.
    Bollinger(Bollinger),
}

impl IndicatorState {
    /// Fresh, warming state for `kind`.
    #[must_use]
    pub fn new(kind: IndicatorKind) -> Self {
        match kind {
            IndicatorKind::Sma { period } => Self::Sma(Sma::new(period)),
            IndicatorKind::Ema { period } => Self::Ema(Ema::new(period)),
            IndicatorKind::Rsi { period } => Self::Rsi(Rsi::new(period)),
            IndicatorKind::Macd { fast, slow, signal } => {
                Self::Macd(Macd::new(fast, slow, signal))
            }
            IndicatorKind::Bollinger { period, multiplier } => {
                Self::Bollinger(Bollinger::new(period, multiplier))
            }
        }
    }

    /// Build state by replaying a close history.
    #[must_use]
    pub fn replay(kind: IndicatorKind, closes: impl IntoIterator<Item = f64>) -> Self {
        let mut state = Self::new(kind);
        for close in closes {
            state.update(close);
        }
        state
    }

    fn inner(&self) -> &dyn Indicator {
        match self {
            Self::Sma(s) => s,
            Self::Ema(s) => s,
            Self::Rsi(s) => s,
            Self::Macd(s) => s,
            Self::Bollinger(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Indicator {
        match self {
            Self::Sma(s) => s,
            Self::Ema(s) => s,
            Self::Rsi(s) => s,
            Self::Macd(s) => s,
            Self::Bollinger(s) => s,
        }
    }
}

impl Indicator for IndicatorState {
    fn update(&mut self, close: f64) -> Option<IndicatorValue> {
        self.inner_mut().update(close)
    }

    fn value(&self) -> Option<IndicatorValue> {
        self.inner().value()
    }

    fn phase(&self) -> IndicatorPhase {
        self.inner().phase()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use test_case::test_case;

    use super::*;

    #[test]
    fn kind_json_defaults() {
        let macd: IndicatorKind = serde_json::from_str(r#"{"kind":"macd"}"#).unwrap();
        assert_eq!(macd, IndicatorKind::macd());

        let bb: IndicatorKind = serde_json::from_str(r#"{"kind":"bollinger"}"#).unwrap();
        assert_eq!(bb, IndicatorKind::bollinger());

        let sma: IndicatorKind = serde_json::from_str(r#"{"kind":"sma","period":5}"#).unwrap();
        assert_eq!(sma, IndicatorKind::Sma { period: 5 });
    }

    #[test]
    fn kind_requires_period_for_moving_averages() {
        assert!(serde_json::from_str::<IndicatorKind>(r#"{"kind":"ema"}"#).is_err());
    }

    #[test_case(IndicatorKind::Sma { period: 0 } ; "zero sma")]
    #[test_case(IndicatorKind::Rsi { period: 0 } ; "zero rsi")]
    #[test_case(IndicatorKind::Sma { period: usize::MAX } ; "overflowing sma")]
    #[test_case(IndicatorKind::Ema { period: MAX_PERIOD + 1 } ; "oversized ema")]
    #[test_case(IndicatorKind::Macd { fast: 1, slow: usize::MAX, signal: 2 } ; "overflowing macd")]
    #[test_case(IndicatorKind::Macd { fast: 12, slow: 26, signal: 1 << 40 } ; "oversized macd signal")]
    #[test_case(IndicatorKind::Bollinger { period: 1 << 44, multiplier: 2.0 } ; "oversized bollinger")]
    #[test_case(IndicatorKind::Macd { fast: 26, slow: 12, signal: 9 } ; "inverted macd")]
    #[test_case(IndicatorKind::Bollinger { period: 20, multiplier: 0.0 } ; "zero multiplier")]
    #[test_case(IndicatorKind::Bollinger { period: 20, multiplier: f64::NAN } ; "nan multiplier")]
    fn invalid_kinds_rejected(kind: IndicatorKind) {
        assert!(kind.validate().is_err());
    }

    #[test]
    fn max_period_accepted() {
        assert!(IndicatorKind::Sma { period: MAX_PERIOD }.validate().is_ok());
        let err = IndicatorKind::Rsi { period: MAX_PERIOD + 1 }.validate().unwrap_err();
        assert_eq!(
            err,
            IndicatorError::Period {
                kind: "rsi",
                period: MAX_PERIOD + 1
            }
        );
    }

    #[test]
    fn warmup_saturates() {
        let macd = IndicatorKind::Macd {
            fast: 1,
            slow: usize::MAX,
            signal: 2,
        };
        assert_eq!(macd.warmup_bars(), usize::MAX - 1);
        assert_eq!(IndicatorKind::Rsi { period: usize::MAX }.warmup_bars(), usize::MAX);
    }

    #[test]
    fn hash_distinguishes_params() {
        let set: HashSet<IndicatorKind> = [
            IndicatorKind::Sma { period: 20 },
            IndicatorKind::Sma { period: 20 },
            IndicatorKind::Sma { period: 50 },
            IndicatorKind::Ema { period: 20 },
            IndicatorKind::bollinger(),
            IndicatorKind::Bollinger {
                period: 20,
                multiplier: 2.5,
            },
        ]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn display_names() {
        assert_eq!(IndicatorKind::Sma { period: 20 }.to_string(), "sma(20)");
        assert_eq!(IndicatorKind::macd().to_string(), "macd(12,26,9)");
        assert_eq!(IndicatorKind::bollinger().to_string(), "bollinger(20,2)");
    }

    #[test]
    fn warmup_bars() {
        assert_eq!(IndicatorKind::Sma { period: 20 }.warmup_bars(), 20);
        assert_eq!(IndicatorKind::Rsi { period: 14 }.warmup_bars(), 15);
        assert_eq!(IndicatorKind::macd().warmup_bars(), 34);
    }

    #[test]
    fn state_phase_matches_warmup() {
        for kind in [
            IndicatorKind::Sma { period: 5 },
            IndicatorKind::Ema { period: 5 },
            IndicatorKind::Rsi { period: 5 },
            IndicatorKind::Macd {
                fast: 3,
                slow: 5,
                signal: 2,
            },
            IndicatorKind::Bollinger {
                period: 5,
                multiplier: 2.0,
            },
        ] {
            let mut state = IndicatorState::new(kind);
            for i in 0..kind.warmup_bars() - 1 {
                #[allow(clippy::cast_precision_loss)]
                let close = 100.0 + i as f64;
                assert!(state.update(close).is_none(), "{kind} ready too early");
                assert!(!state.phase().is_ready());
            }
            assert!(state.update(110.0).is_some(), "{kind} not ready");
            assert_eq!(state.phase(), IndicatorPhase::Ready);
        }
    }

    #[test]
    fn output_serializes_tagged() {
        let output = IndicatorOutput {
            indicator: IndicatorKind::Rsi { period: 14 },
            time: DateTime::from_timestamp_millis(0).unwrap(),
            phase: IndicatorPhase::Ready,
            value: Some(IndicatorValue::Rsi { value: 50.0 }),
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["indicator"]["kind"], "rsi");
        assert_eq!(json["phase"]["state"], "ready");
        assert_eq!(json["value"]["value"], 50.0);
    }
}
