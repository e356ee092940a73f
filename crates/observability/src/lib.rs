//! Tracing/logging setup shared by every process that runs the pipeline.

pub use tracing::{LogFormat, TracingConfig, init_with};

/// Tracing configuration (filters, layers).
pub mod tracing;
