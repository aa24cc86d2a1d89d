//! Collector module - cost estimation and trace persistence
//!
//! The traced transport hands finished traces to a [`TraceSink`]. The
//! [`Pipeline`] sink batches them into the SQLite store in the background.

mod cost;
mod pipeline;
mod sink;

pub use cost::{CostCalculator, ModelPricing};
pub use pipeline::{Pipeline, PipelineStats};
pub use sink::{MemorySink, NoopSink, TraceSink};
