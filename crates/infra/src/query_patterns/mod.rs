//! Query pattern tracking and index suggestion feedback loop.

pub mod optimizer;
pub mod pattern;
pub mod tracked;

pub use optimizer::{AnalysisReport, Observation, OptimizerConfig, OptimizerHandle, OptimizerStats, QueryPatternOptimizer};
pub use pattern::{DetectedQueryPattern, ExecutedQuery, QueryShape, SortField, filter_fields};
pub use tracked::TrackedQueries;
