//! Feed Connector
//!
//! Owns the single WebSocket connection to the upstream price feed.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!                      ▲              │ error / heartbeat timeout
//!                      │              ▼
//!                      └──────── Degraded (backoff)
//! ```
//!
//! The read loop never waits on downstream work: ticks go into the
//! drop-oldest [`TickSink`]. Subscription changes arrive through a
//! [`FeedHandle`] and are replayed in full after every reconnect. Ticks read
//! after a reconnect carry a new epoch so the normalizer starts fresh buckets.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, FeedCodec};
use super::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
use super::messages::{FeedMessage, FeedRequest};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::FeedControl;
use crate::application::services::TickSink;
use crate::domain::streaming::ConnectionState;
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end one connection. All of them lead to a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum FeedClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    /// The handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No answer to a liveness probe.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Connection closed by the server.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FeedClientError {
    const fn kind(&self) -> &'static str {
        match self {
            Self::WebSocket(_) => "websocket",
            Self::Encode(_) => "encode",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ConnectionClosed => "closed",
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Default handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the feed connector.
#[derive(Debug, Clone)]
pub struct FeedConnectorConfig {
    /// WebSocket URL.
    pub url: String,
    /// Upper bound on the TCP + WebSocket handshake.
    pub connect_timeout: Duration,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
}

impl FeedConnectorConfig {
    /// Create a new configuration with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
}

/// Cloneable control handle for a running [`FeedConnector`].
#[derive(Debug, Clone)]
pub struct FeedHandle {
    symbols: Arc<RwLock<BTreeSet<String>>>,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl FeedHandle {
    /// Watch the connection state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Current connection state.
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Symbols currently requested from the feed.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        self.symbols.read().iter().cloned().collect()
    }
}

impl FeedControl for FeedHandle {
    fn subscribe(&self, symbol: &str) {
        if self.symbols.write().insert(symbol.to_string()) {
            let _ = self.commands.send(Command::Subscribe(symbol.to_string()));
        }
    }

    fn unsubscribe(&self, symbol: &str) {
        if self.symbols.write().remove(symbol) {
            let _ = self.commands.send(Command::Unsubscribe(symbol.to_string()));
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// WebSocket client for the upstream price feed.
///
/// Manages the connection lifecycle including:
/// - Heartbeat monitoring
/// - Automatic reconnection with exponential backoff, retried forever
/// - Subscription replay and gap signalling after reconnects
pub struct FeedConnector {
    config: FeedConnectorConfig,
    codec: FeedCodec,
    sink: TickSink,
    cancel: CancellationToken,
    symbols: Arc<RwLock<BTreeSet<String>>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl FeedConnector {
    /// Create a connector and its control handle.
    #[must_use]
    pub fn new(
        config: FeedConnectorConfig,
        sink: TickSink,
        cancel: CancellationToken,
    ) -> (Self, FeedHandle) {
        let symbols = Arc::new(RwLock::new(BTreeSet::new()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let state = Arc::new(state_tx);

        let handle = FeedHandle {
            symbols: Arc::clone(&symbols),
            commands: commands_tx,
            state: Arc::clone(&state),
        };
        let connector = Self {
            config,
            codec: FeedCodec::new(),
            sink,
            cancel,
            symbols,
            commands: commands_rx,
            state,
        };
        (connector, handle)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Feed state changed");
        }
    }

    /// Run the connection loop until cancelled.
    ///
    /// Connection failures are retried indefinitely.
    pub async fn run(mut self) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());
        let mut connected_before = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let mut connected_at = None;

            match self.connect_and_run(&mut connected_at, connected_before).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Feed connection error");
                    metrics::record_feed_error(e.kind());
                }
            }

            if let Some(at) = connected_at {
                connected_before = true;
                policy.connection_ended(at.elapsed());
            }

            let delay = policy.next_delay();
            let attempt = policy.attempt_count();
            self.sink.reconnect();
            self.set_state(ConnectionState::Degraded {
                attempt,
                retry_in_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            });
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis(),
                "Reconnecting to feed"
            );

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Feed connector stopped");
    }

    /// Connect and process frames until error or cancellation.
    ///
    /// Returns `Ok(())` only on cancellation.
    async fn connect_and_run(
        &mut self,
        connected_at: &mut Option<Instant>,
        is_reconnect: bool,
    ) -> Result<(), FeedClientError> {
        tracing::info!(url = %self.config.url, "Connecting to feed");

        let connect_timeout = self.config.connect_timeout;
        let connect = tokio::time::timeout(
            connect_timeout,
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        );
        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = connect => {
                result.map_err(|_| FeedClientError::ConnectTimeout(connect_timeout))??
            }
        };
        let (mut write, mut read) = ws_stream.split();

        *connected_at = Some(Instant::now());
        self.set_state(ConnectionState::Connected);

        // The symbol set is authoritative; queued commands are already in it.
        while self.commands.try_recv().is_ok() {}
        let symbols: Vec<String> = self.symbols.read().iter().cloned().collect();
        if !symbols.is_empty() {
            tracing::debug!(count = symbols.len(), "Replaying subscriptions");
            write
                .send(Message::Text(FeedRequest::subscribe(symbols).to_json()?.into()))
                .await?;
        }
        if is_reconnect {
            self.sink.gap();
        }

        let mut heartbeat = Heartbeat::new(self.config.heartbeat.clone());

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                event = heartbeat.next() => match event {
                    HeartbeatEvent::SendPing => {
                        write.send(Message::Text(FeedRequest::ping().to_json()?.into())).await?;
                    }
                    HeartbeatEvent::Timeout => return Err(FeedClientError::HeartbeatTimeout),
                },
                command = self.commands.recv() => {
                    let request = match command {
                        Some(Command::Subscribe(symbol)) => FeedRequest::subscribe(vec![symbol]),
                        Some(Command::Unsubscribe(symbol)) => FeedRequest::unsubscribe(vec![symbol]),
                        None => continue,
                    };
                    tracing::debug!(
                        action = ?request.action,
                        symbols = ?request.symbols,
                        "Sending feed request"
                    );
                    write.send(Message::Text(request.to_json()?.into())).await?;
                }
                msg = read.next() => {
                    heartbeat.record_activity();
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("Server sent close frame");
                            return Err(FeedClientError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!("WebSocket stream ended");
                            return Err(FeedClientError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    /// Decode a text frame and forward its ticks.
    ///
    /// Undecodable frames are counted and skipped.
    fn handle_text(&self, text: &str) {
        let messages = match self.codec.decode(text) {
            Ok(messages) => messages,
            Err(e) => {
                self.on_malformed(&e);
                return;
            }
        };

        for message in messages {
            match message {
                FeedMessage::Tick(tick) => match tick.into_tick() {
                    Some(tick) => {
                        self.sink.tick(tick);
                    }
                    None => self.sink.malformed(1),
                },
                FeedMessage::Subscribed(sub) => {
                    tracing::debug!(symbols = ?sub.symbols, "Subscription confirmed");
                }
                FeedMessage::Pong => {}
                FeedMessage::Error(error) => {
                    tracing::warn!(code = error.code, message = %error.message, "Feed error");
                    metrics::record_feed_error("server");
                }
            }
        }
    }

    fn on_malformed(&self, error: &CodecError) {
        tracing::debug!(error = %error, "Dropping undecodable frame");
        metrics::record_feed_error("decode");
        self.sink.malformed(1);
    }
}

impl std::fmt::Debug for FeedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConnector")
            .field("url", &self.config.url)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}
