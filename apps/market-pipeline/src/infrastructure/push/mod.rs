//! Consumer Push Server
//!
//! WebSocket endpoint for chart and dashboard consumers.
//!
//! # Protocol
//!
//! Consumers send JSON commands:
//!
//! ```json
//! {"op":"attach","symbol":"BTC-USD","timeframe":"1m","indicators":[{"kind":"sma","period":20}]}
//! {"op":"detach","symbol":"BTC-USD","timeframe":"1m"}
//! ```
//!
//! and receive typed [`PushEvent`]s (`snapshot`, `bar`, `indicator`,
//! `status`, `error`) as JSON text frames. Each attach is answered with a
//! snapshot before any live update for that series.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::Pipeline;
use crate::domain::indicators::IndicatorKind;
use crate::domain::market::{SeriesKey, Symbol, Timeframe};
use crate::domain::streaming::PushEvent;
use crate::domain::subscription::SubscriberId;

/// Command sent by a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConsumerCommand {
    /// Attach to a series; replaces any previous indicator set for it.
    Attach {
        /// Instrument symbol.
        symbol: Symbol,
        /// Bucket length, e.g. `"1m"`.
        timeframe: Timeframe,
        /// Indicators to stream.
        #[serde(default)]
        indicators: Vec<IndicatorKind>,
    },
    /// Detach from a series.
    Detach {
        /// Instrument symbol.
        symbol: Symbol,
        /// Bucket length.
        timeframe: Timeframe,
    },
}

#[derive(Clone)]
struct PushState {
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
}

/// WebSocket push server.
pub struct PushServer {
    port: u16,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
}

impl PushServer {
    /// Create a new push server.
    #[must_use]
    pub const fn new(port: u16, pipeline: Arc<Pipeline>, cancel: CancellationToken) -> Self {
        Self {
            port,
            pipeline,
            cancel,
        }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the server stops abnormally.
    pub async fn run(self) -> Result<(), PushServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PushServerError::BindFailed(self.port, e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server stops abnormally.
    pub async fn serve(self, listener: TcpListener) -> Result<(), PushServerError> {
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, "Push server listening");

        let app = router(Arc::clone(&self.pipeline), self.cancel.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| PushServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Push server stopped");
        Ok(())
    }
}

/// Build the push routes (`GET /stream`).
pub fn router(pipeline: Arc<Pipeline>, cancel: CancellationToken) -> Router {
    Router::new()
        .route("/stream", get(stream_handler))
        .with_state(PushState { pipeline, cancel })
}

async fn stream_handler(ws: WebSocketUpgrade, State(state): State<PushState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: PushState) {
    let PushState { pipeline, cancel } = state;
    let mut handle = pipeline.connect();
    let id = handle.id;
    let (mut sender, mut receiver) = socket.split();
    tracing::info!(subscriber_id = id, "Consumer connected");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            event = handle.events.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(event.as_ref()) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to encode push event"),
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => apply_command(&pipeline, id, text.as_str()),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    pipeline.disconnect(id);
    tracing::info!(
        subscriber_id = id,
        dropped = handle.events.dropped(),
        "Consumer disconnected"
    );
}

/// Apply one consumer command. Failures are reported to the consumer as
/// `error` events.
fn apply_command(pipeline: &Pipeline, subscriber: SubscriberId, text: &str) {
    let command = match serde_json::from_str::<ConsumerCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!(subscriber_id = subscriber, error = %e, "Invalid consumer command");
            pipeline
                .router()
                .send_to(subscriber, PushEvent::error(format!("invalid command: {e}")));
            return;
        }
    };

    match command {
        ConsumerCommand::Attach {
            symbol,
            timeframe,
            indicators,
        } => {
            let key = SeriesKey::new(symbol, timeframe);
            if let Err(e) = pipeline.attach(subscriber, &key, &indicators) {
                pipeline
                    .router()
                    .send_to(subscriber, PushEvent::error(format!("attach {key} failed: {e}")));
            }
        }
        ConsumerCommand::Detach { symbol, timeframe } => {
            let key = SeriesKey::new(symbol, timeframe);
            if !pipeline.detach(subscriber, &key) {
                pipeline
                    .router()
                    .send_to(subscriber, PushEvent::error(format!("not attached to {key}")));
            }
        }
    }
}

/// Push server errors.
#[derive(Debug, thiserror::Error)]
pub enum PushServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::NoopFeedControl;
    use crate::application::services::PipelineSettings;

    fn pipeline() -> Pipeline {
        Pipeline::new(PipelineSettings::default(), Arc::new(NoopFeedControl))
    }

    #[test]
    fn parses_attach_with_default_parameters() {
        let command: ConsumerCommand = serde_json::from_str(
            r#"{"op":"attach","symbol":"BTC-USD","timeframe":"5m","indicators":[{"kind":"macd"},{"kind":"rsi","period":14}]}"#,
        )
        .unwrap();

        assert_eq!(
            command,
            ConsumerCommand::Attach {
                symbol: "BTC-USD".to_string(),
                timeframe: Timeframe::FIVE_MINUTES,
                indicators: vec![IndicatorKind::macd(), IndicatorKind::Rsi { period: 14 }],
            }
        );
    }

    #[test]
    fn invalid_commands_produce_error_events() {
        let pipeline = pipeline();
        let mut handle = pipeline.connect();

        apply_command(&pipeline, handle.id, "{not json");
        apply_command(
            &pipeline,
            handle.id,
            r#"{"op":"attach","symbol":"BTC-USD","timeframe":"1m","indicators":[{"kind":"sma","period":0}]}"#,
        );
        apply_command(
            &pipeline,
            handle.id,
            r#"{"op":"detach","symbol":"BTC-USD","timeframe":"1m"}"#,
        );

        for _ in 0..3 {
            let event = handle.events.try_recv().unwrap();
            assert_eq!(event.kind(), "error");
        }
        assert!(handle.events.try_recv().is_none());
    }

    #[test]
    fn attach_then_detach() {
        let pipeline = pipeline();
        let mut handle = pipeline.connect();

        apply_command(
            &pipeline,
            handle.id,
            r#"{"op":"attach","symbol":"BTC-USD","timeframe":"1m"}"#,
        );
        assert_eq!(handle.events.try_recv().unwrap().kind(), "snapshot");

        apply_command(
            &pipeline,
            handle.id,
            r#"{"op":"detach","symbol":"BTC-USD","timeframe":"1m"}"#,
        );
        assert!(handle.events.try_recv().is_none());
        assert_eq!(
            pipeline
                .router()
                .series_refcount(&SeriesKey::new("BTC-USD", Timeframe::MINUTE)),
            0
        );
    }
}
