//! Real-time session pipeline.
//!
//! The [`SessionRegistry`] owns live sessions and routes inbound frames;
//! each accepted input runs a [`TurnPipeline`] turn in its own task, which
//! consults the shared [`ArtifactCache`] before rendering video.

use std::sync::Arc;

use facetalk_core::config::Config;
use facetalk_stages::Stages;

pub mod cache;
pub mod jobs;
pub mod metrics;
pub mod registry;
pub mod turn;

pub use cache::{ArtifactCache, CacheEntry, CacheStats, RecordOutcome};
pub use jobs::{Backoff, Job, JobError, JobLimits, JobRunner, RenderJob, RetryPolicy};
pub use registry::{LiveSession, RegistryError, SessionRegistry};
pub use turn::{PipelineSettings, RenderStep, Rendered, TurnFailure, TurnPipeline};

/// Wire the configured adapters, cache, and settings into a pipeline.
pub fn build_pipeline(config: &Config, stages: Stages) -> Arc<TurnPipeline> {
    Arc::new(TurnPipeline::new(
        stages,
        Arc::new(ArtifactCache::from_config(config)),
        PipelineSettings::from_config(config),
    ))
}
