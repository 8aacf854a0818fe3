//! Domain Layer - Core market-data types and computation.
//!
//! Pure, synchronous logic with no I/O: bucketing ticks into bars,
//! incremental indicators, snapshot buffers and interest tracking. All
//! types here are plain Rust with serialization support.

/// Ticks, bars, timeframes and series keys.
pub mod market;

/// Tick-to-bar normalization.
pub mod normalizer;

/// Incremental technical indicators.
pub mod indicators;

/// Recent-history ring buffers.
pub mod snapshot;

/// Subscriber interest tracking.
pub mod subscription;

/// Outbound push events and feed connection state.
pub mod streaming;
