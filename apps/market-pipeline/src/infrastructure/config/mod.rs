//! Configuration Module
//!
//! Configuration loading for the pipeline service.

mod settings;

pub use settings::{
    ConfigError, PipelineConfig, PipelineTuning, ServerSettings, WebSocketSettings,
};
