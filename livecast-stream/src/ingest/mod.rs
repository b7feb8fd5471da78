pub mod pipeline;

pub use pipeline::{IngestPipeline, PipelineError, RunOutcome};
