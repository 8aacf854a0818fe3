//! Application Layer - Use cases and port definitions.
//!
//! This layer wires the domain components into a running pipeline and
//! defines the ports the pipeline needs from the outside world.

/// Port interfaces for external systems (feed control, history).
pub mod ports;

/// Pipeline, subscription router, queues and runtime tasks.
pub mod services;
