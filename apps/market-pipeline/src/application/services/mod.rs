//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `Pipeline`: Sharded normalizer, indicator and snapshot state with fan-out
//! - `SubscriptionRouter`: Per-subscriber drop-oldest queues and interest routing
//! - `PipelineRuntime`: Dispatcher, shard workers, janitor and status relay

pub mod pipeline;
pub mod queue;
pub mod router;
pub mod runtime;

pub use pipeline::{
    AttachError, Pipeline, PipelineSettings, PipelineStats, PipelineStatus, StatsSnapshot,
};
pub use queue::{QueueReceiver, QueueSender, drop_oldest};
pub use router::{DEFAULT_SUBSCRIBER_BUFFER, RouterStats, SubscriberHandle, SubscriptionRouter};
pub use runtime::{PipelineRuntime, QueuedTick, RuntimeConfig, TickSink, tick_queue};
