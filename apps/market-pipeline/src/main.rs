//! Market Pipeline Binary
//!
//! Starts the streaming market-data pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-pipeline
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_FEED_URL`: Upstream tick feed WebSocket URL
//!
//! ## Optional
//! - `MARKET_PIPELINE_PUSH_PORT`: Consumer WebSocket port (default: 8090)
//! - `MARKET_PIPELINE_HEALTH_PORT`: Health/metrics HTTP port (default: 8091)
//! - `MARKET_PIPELINE_TICK_QUEUE_CAPACITY`: Tick queue size (default: 10000)
//! - `MARKET_PIPELINE_SUBSCRIBER_BUFFER`: Per-consumer buffer (default: 256)
//! - `MARKET_PIPELINE_SNAPSHOT_CAPACITY`: Bars kept per series (default: 500)
//! - `MARKET_PIPELINE_GRACE_PERIOD_SECS`: Teardown grace period (default: 30)
//! - `MARKET_PIPELINE_WORKER_SHARDS`: Symbol shards (default: 4)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-pipeline)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use market_pipeline::application::services::PipelineStats;
use market_pipeline::infrastructure::telemetry;
use market_pipeline::{
    FeedConnector, HealthServer, HealthServerState, Pipeline, PipelineConfig, PipelineRuntime,
    PushServer, init_metrics, tick_queue,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Pipeline");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = PipelineConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // The connector and the pipeline share one set of counters
    let stats = Arc::new(PipelineStats::default());
    let (sink, ticks) = tick_queue(config.pipeline.tick_queue_capacity, Arc::clone(&stats));

    let (connector, feed) = FeedConnector::new(
        config.feed_connector_config(),
        sink,
        shutdown_token.clone(),
    );
    let feed_state = feed.state();

    let pipeline = Arc::new(Pipeline::with_stats(
        config.pipeline_settings(),
        Arc::new(feed),
        stats,
    ));

    let runtime = PipelineRuntime::spawn(
        Arc::clone(&pipeline),
        ticks,
        feed_state.clone(),
        &config.runtime_config(),
        &shutdown_token,
    );

    // Spawn feed connector
    let connector_task = tokio::spawn(connector.run());

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&pipeline),
        feed_state,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn push server
    let push_server = PushServer::new(
        config.server.push_port,
        Arc::clone(&pipeline),
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = push_server.run().await {
            tracing::error!(error = %e, "Push server error");
        }
    });

    tracing::info!("Market pipeline ready");

    await_shutdown(shutdown_token).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        if let Err(e) = connector_task.await {
            tracing::error!(error = %e, "Feed connector task failed");
        }
        runtime.join().await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Shutdown timeout elapsed before tasks finished");
    }

    let stats = pipeline.stats().snapshot();
    tracing::info!(
        ticks_received = stats.ticks_received,
        ticks_processed = stats.ticks_processed,
        bars_closed = stats.bars_closed,
        "Market pipeline stopped"
    );
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &PipelineConfig) {
    tracing::info!(
        push_port = config.server.push_port,
        health_port = config.server.health_port,
        shards = config.pipeline.worker_shards,
        tick_queue = config.pipeline.tick_queue_capacity,
        "Configuration loaded"
    );
    tracing::debug!(
        feed_url = %config.feed_url,
        snapshot_capacity = config.pipeline.snapshot_capacity,
        subscriber_buffer = config.pipeline.subscriber_buffer,
        grace_period_secs = config.pipeline.grace_period.as_secs(),
        "Pipeline settings"
    );
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
