pub mod scheduler;

pub use scheduler::{PipelineConfig, PipelineScheduler, RunSummary};
