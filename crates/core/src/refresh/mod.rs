//! Batch refresh of the metrics cache against a rate-limited provider.

pub mod backoff;
pub mod orchestrator;
pub mod pacer;
pub mod pipeline;

pub use backoff::BackoffPolicy;
pub use orchestrator::{BatchRefreshOrchestrator, RefreshMode, RefreshOptions, RefreshReport};
pub use pacer::Pacer;
pub use pipeline::{EntityOutcome, EntityPipeline, EntityState, PipelineOptions};
