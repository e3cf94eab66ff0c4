pub mod analyzer;
pub mod pipeline;

pub use analyzer::{Analysis, Analyzer, KeyedLocks};
pub use pipeline::{PipelineOutput, SignalPipeline};
