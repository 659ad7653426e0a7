//! Gateway shared state.

use std::path::PathBuf;
use std::sync::Arc;

use facetalk_core::config::Config;
use facetalk_pipeline::{JobRunner, SessionRegistry};
use facetalk_stages::{AvatarDirectory, Stages};

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub avatars: Arc<dyn AvatarDirectory>,
    /// Runs pre-render jobs submitted to `/prewarm`.
    pub jobs: Arc<JobRunner>,
    /// Directory served under `/media`, if any.
    pub media_dir: Option<PathBuf>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, registry: Arc<SessionRegistry>) -> Self {
        let avatars = registry.pipeline().stages().avatars.clone();
        let jobs = Arc::new(JobRunner::from_config(&config.jobs()));
        Self {
            config,
            registry,
            avatars,
            jobs,
            media_dir: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Build the configured adapters, pipeline, and registry.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let stages = Stages::from_config(&config)?;
        let pipeline = facetalk_pipeline::build_pipeline(&config, stages);
        let registry = Arc::new(SessionRegistry::new(pipeline));
        let media_dir = Some(config.storage_dir());
        Ok(Self::new(Arc::new(config), registry).with_media_dir(media_dir))
    }

    pub fn with_media_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.media_dir = dir;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
