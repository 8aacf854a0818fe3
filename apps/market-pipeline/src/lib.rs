#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Pipeline - Streaming Bars and Indicators
//!
//! Maintains one connection to an upstream tick feed, aggregates ticks into
//! OHLCV bars per symbol and timeframe, computes technical indicators
//! incrementally and pushes updates to many WebSocket consumers, each
//! seeing only the series it attached to.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure market-data logic
//!   - `market`: Ticks, bars, timeframes
//!   - `normalizer`: Tick bucketing, gap fill, ordering rules
//!   - `indicators`: SMA, EMA, RSI, MACD, Bollinger Bands
//!   - `snapshot`: Bounded recent history per series
//!   - `subscription`: Reference-counted interest
//!   - `streaming`: Push events and feed state
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Upstream feed control, history provider
//!   - `services`: Pipeline, subscription router, runtime tasks
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `feed`: Upstream WebSocket connector
//!   - `push`: Consumer WebSocket server
//!   - `health`: Health, snapshot and metrics HTTP endpoint
//!   - `config`: Environment configuration
//!
//! # Data Flow
//!
//! ```text
//!                 ┌──────────────┐     ┌────────────┐     ┌─────────────┐
//! Upstream WS ───►│    Feed      │────►│ drop-oldest│────►│ shard       │
//!                 │  Connector   │     │ tick queue │     │ workers     │
//!                 └──────────────┘     └────────────┘     └──────┬──────┘
//!                        ▲                                       │ bars,
//!                        │ subscribe/unsubscribe                 │ indicators
//!                 ┌──────┴───────┐     ┌────────────┐            ▼
//!                 │ Subscription │◄────│   Push     │◄──── Subscription
//!                 │    Router    │────►│   Server   │───► Client 1..N
//!                 └──────────────┘     └────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market-data types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::indicators::{IndicatorKind, IndicatorOutput, IndicatorValue};
pub use domain::market::{Bar, SeriesKey, Symbol, Tick, Timeframe};
pub use domain::snapshot::Snapshot;
pub use domain::streaming::{ConnectionState, PushEvent};
pub use domain::subscription::SubscriberId;

// Application services
pub use application::services::{
    AttachError, Pipeline, PipelineRuntime, PipelineSettings, PipelineStatus, QueuedTick,
    RuntimeConfig, StatsSnapshot, SubscriberHandle, TickSink, tick_queue,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, PipelineConfig, PipelineTuning, ServerSettings, WebSocketSettings,
};

// Feed connector
pub use infrastructure::feed::{FeedConnector, FeedConnectorConfig, FeedHandle};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::push::{ConsumerCommand, PushServer, PushServerError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
