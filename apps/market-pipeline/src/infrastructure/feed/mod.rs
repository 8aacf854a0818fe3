//! Feed Adapter
//!
//! WebSocket client for the upstream price feed (JSON text frames).

pub mod codec;
pub mod connector;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;

pub use codec::{CodecError, FeedCodec};
pub use connector::{FeedClientError, FeedConnector, FeedConnectorConfig, FeedHandle};
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
pub use messages::{FeedAction, FeedMessage, FeedRequest, TickMessage};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
