//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, pipeline status, snapshots and
//! Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status with pipeline counters
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (feed connected)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /snapshot/{symbol}/{timeframe}` - Current snapshot of a series

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::application::services::{Pipeline, PipelineStatus};
use crate::domain::market::{SeriesKey, Timeframe};
use crate::domain::streaming::ConnectionState;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Feed connection state.
    pub feed: ConnectionState,
    /// Pipeline counters and sizes.
    pub pipeline: PipelineStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Feed connected.
    Healthy,
    /// Feed reconnecting; cached data is still served.
    Degraded,
    /// Feed disconnected.
    Unhealthy,
}

impl From<ConnectionState> for HealthStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => Self::Healthy,
            ConnectionState::Connecting | ConnectionState::Degraded { .. } => Self::Degraded,
            ConnectionState::Disconnected => Self::Unhealthy,
        }
    }
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    pipeline: Arc<Pipeline>,
    feed_state: watch::Receiver<ConnectionState>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        pipeline: Arc<Pipeline>,
        feed_state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            pipeline,
            feed_state,
        }
    }

    fn health(&self) -> HealthResponse {
        let feed = *self.feed_state.borrow();
        HealthResponse {
            status: feed.into(),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            feed,
            pipeline: self.pipeline.status(),
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the health routes.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/snapshot/{symbol}/{timeframe}", get(snapshot_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = state.health();
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.feed_state.borrow().is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn snapshot_handler(
    State(state): State<Arc<HealthServerState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> Response {
    let timeframe = match timeframe.parse::<Timeframe>() {
        Ok(timeframe) => timeframe,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let key = SeriesKey::new(symbol, timeframe);
    state.pipeline.snapshot(&key).map_or_else(
        || (StatusCode::NOT_FOUND, format!("no series {key}")).into_response(),
        |snapshot| Json(snapshot).into_response(),
    )
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use rust_decimal::Decimal;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::NoopFeedControl;
    use crate::application::services::PipelineSettings;
    use crate::domain::market::{Tick, millis_to_utc};

    fn state(feed: ConnectionState) -> (Arc<HealthServerState>, Arc<Pipeline>) {
        let pipeline = Arc::new(Pipeline::new(
            PipelineSettings::default(),
            Arc::new(NoopFeedControl),
        ));
        let (_tx, rx) = watch::channel(feed);
        let state = HealthServerState::new("test".to_string(), Arc::clone(&pipeline), rx);
        (Arc::new(state), pipeline)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn health_status_follows_feed() {
        assert_eq!(HealthStatus::from(ConnectionState::Connected), HealthStatus::Healthy);
        assert_eq!(
            HealthStatus::from(ConnectionState::Degraded {
                attempt: 1,
                retry_in_ms: 500
            }),
            HealthStatus::Degraded
        );
        assert_eq!(HealthStatus::from(ConnectionState::Disconnected), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn health_reports_pipeline_status() {
        let (state, _pipeline) = state(ConnectionState::Connected);
        let (status, body) = get(router(state), "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["feed"]["state"], "connected");
        assert_eq!(json["pipeline"]["stats"]["ticks_received"], 0);
    }

    #[tokio::test]
    async fn readiness_requires_connected_feed() {
        let (state, _pipeline) = state(ConnectionState::Connecting);
        let (status, _) = get(router(state), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn snapshot_endpoint() {
        let (state, pipeline) = state(ConnectionState::Connected);
        let key = SeriesKey::new("BTC-USD", Timeframe::MINUTE);
        let sub = pipeline.connect();
        pipeline.attach(sub.id, &key, &[]).unwrap();
        pipeline.process_tick(&Tick::new(
            "BTC-USD",
            Decimal::from(100),
            Decimal::ONE,
            millis_to_utc(1_700_000_100_000),
        ));

        let (status, body) = get(router(Arc::clone(&state)), "/snapshot/BTC-USD/1m").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["open_bar"]["open"], "100");

        let (status, _) = get(router(Arc::clone(&state)), "/snapshot/ETH-USD/1m").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(router(state), "/snapshot/BTC-USD/often").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
