//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the network servers.

/// Configuration loading.
pub mod config;

/// Upstream feed WebSocket connector.
pub mod feed;

/// Health check, snapshot and metrics HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Consumer WebSocket push server.
pub mod push;

/// OpenTelemetry tracing integration.
pub mod telemetry;
