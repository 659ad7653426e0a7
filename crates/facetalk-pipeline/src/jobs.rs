//! Background job runner with bounded retries and time limits.
//!
//! Jobs are deduplicated by idempotency key while in flight. Each attempt
//! gets a fresh cancellation token that fires at the soft limit so the job
//! can wind down; at the hard limit the attempt is abandoned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use facetalk_core::config::JobsConfig;
use facetalk_stages::StageContext;

use crate::cache::fingerprint;
use crate::turn::{RenderStep, Rendered, TurnFailure, TurnPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(config: &JobsConfig) -> Self {
        let initial = Duration::from_millis(config.backoff_ms);
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::Exponential {
                initial,
                max: initial.saturating_mul(32),
            },
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLimits {
    pub soft: Duration,
    pub hard: Duration,
}

impl JobLimits {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            soft: Duration::from_secs(config.soft_limit_secs),
            hard: Duration::from_secs(config.hard_limit_secs),
        }
    }
}

impl Default for JobLimits {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("Job already running: {0}")]
    Duplicate(String),

    #[error("Job {key} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Job runner shut down")]
    Shutdown,
}

/// A unit of idempotent background work.
#[async_trait]
pub trait Job: Send + Sync {
    type Output: Send;

    fn name(&self) -> &str;

    /// Jobs with equal keys produce the same result.
    fn idempotency_key(&self) -> String;

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<Self::Output>;
}

/// Removes the idempotency key when the run ends.
struct InFlight<'a> {
    keys: &'a DashMap<String, ()>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

pub struct JobRunner {
    policy: RetryPolicy,
    limits: JobLimits,
    in_flight: DashMap<String, ()>,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub fn new(policy: RetryPolicy, limits: JobLimits) -> Self {
        Self {
            policy,
            limits,
            in_flight: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &JobsConfig) -> Self {
        Self::new(RetryPolicy::from_config(config), JobLimits::from_config(config))
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Cancel every running attempt and refuse further retries.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn run<J: Job>(&self, job: &J) -> Result<J::Output, JobError> {
        let key = job.idempotency_key();
        if self.in_flight.insert(key.clone(), ()).is_some() {
            return Err(JobError::Duplicate(key));
        }
        let _guard = InFlight {
            keys: &self.in_flight,
            key: key.clone(),
        };

        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            if self.shutdown.is_cancelled() {
                return Err(JobError::Shutdown);
            }

            match self.attempt(job).await {
                Ok(output) => {
                    info!(job = job.name(), key = %key, attempt, "Job succeeded");
                    return Ok(output);
                }
                Err(e) => {
                    warn!(job = job.name(), key = %key, attempt, error = %e, "Job attempt failed");
                    last_error = e;
                }
            }

            if attempt < self.policy.max_attempts {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(JobError::Shutdown),
                    _ = tokio::time::sleep(self.policy.delay_for(attempt)) => {}
                }
            }
        }

        Err(JobError::Exhausted {
            key,
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    async fn attempt<J: Job>(&self, job: &J) -> Result<J::Output, String> {
        let token = self.shutdown.child_token();
        let run = job.run(token.clone());
        tokio::pin!(run);

        let soft = tokio::time::sleep(self.limits.soft);
        let hard = tokio::time::sleep(self.limits.hard);
        tokio::pin!(soft);
        tokio::pin!(hard);

        loop {
            tokio::select! {
                res = &mut run => return res.map_err(|e| format!("{e:#}")),
                _ = &mut soft, if !token.is_cancelled() => {
                    warn!(job = job.name(), "Soft time limit reached, cancelling");
                    token.cancel();
                }
                _ = &mut hard => {
                    token.cancel();
                    return Err(format!(
                        "hard time limit of {}s exceeded",
                        self.limits.hard.as_secs()
                    ));
                }
            }
        }
    }
}

/// Pre-render a video for (avatar, text) through the live render path, so a
/// later turn with the same reply is served from the cache.
pub struct RenderJob {
    pipeline: Arc<TurnPipeline>,
    avatar_id: String,
    text: String,
}

impl RenderJob {
    pub fn new(pipeline: Arc<TurnPipeline>, avatar_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            pipeline,
            avatar_id: avatar_id.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
impl Job for RenderJob {
    type Output = Rendered;

    fn name(&self) -> &str {
        "render"
    }

    fn idempotency_key(&self) -> String {
        format!("render:{}", fingerprint(&self.avatar_id, &self.text))
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<Rendered> {
        let scratch = self.pipeline.scratch_dir()?;
        let ctx = StageContext {
            session_id: "jobs".into(),
            cancel,
            scratch_dir: scratch.path().to_path_buf(),
        };
        let result = self
            .pipeline
            .render(Some(&self.avatar_id), &self.text, &ctx, &mut |_: RenderStep| {})
            .await;
        drop(scratch);

        result.map_err(|e| match e {
            TurnFailure::Failed { kind, message } => anyhow::anyhow!("{kind}: {message}"),
            TurnFailure::Cancelled => anyhow::anyhow!("render cancelled"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Job for Flaky {
        type Output = u32;

        fn name(&self) -> &str {
            "flaky"
        }

        fn idempotency_key(&self) -> String {
            "flaky".into()
        }

        async fn run(&self, _cancel: CancellationToken) -> anyhow::Result<u32> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures_before_success {
                anyhow::bail!("attempt {n} failed");
            }
            Ok(n)
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Job for Sleeper {
        type Output = &'static str;

        fn name(&self) -> &str {
            "sleeper"
        }

        fn idempotency_key(&self) -> String {
            "sleeper".into()
        }

        async fn run(&self, cancel: CancellationToken) -> anyhow::Result<&'static str> {
            cancel.cancelled().await;
            Ok("wound down")
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_millis(350),
            },
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30), Duration::from_millis(350));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RetryPolicy::from_config(&JobsConfig::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        let limits = JobLimits::default();
        assert!(limits.soft < limits.hard);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let runner = JobRunner::new(fast_policy(3), JobLimits::default());
        let job = Flaky {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        };
        assert_eq!(runner.run(&job).await.unwrap(), 3);
        assert!(!runner.is_running("flaky"));
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let runner = JobRunner::new(fast_policy(2), JobLimits::default());
        let job = Flaky {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
        };
        match runner.run(&job).await {
            Err(JobError::Exhausted { attempts, last_error, .. }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("attempt 2"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(job.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_soft_limit_cancels_job() {
        let runner = JobRunner::new(
            fast_policy(1),
            JobLimits {
                soft: Duration::from_millis(10),
                hard: Duration::from_secs(5),
            },
        );
        assert_eq!(runner.run(&Sleeper).await.unwrap(), "wound down");
    }

    #[tokio::test]
    async fn test_hard_limit_abandons_attempt() {
        struct Stuck;

        #[async_trait]
        impl Job for Stuck {
            type Output = ();

            fn name(&self) -> &str {
                "stuck"
            }

            fn idempotency_key(&self) -> String {
                "stuck".into()
            }

            async fn run(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let runner = JobRunner::new(
            fast_policy(1),
            JobLimits {
                soft: Duration::from_millis(5),
                hard: Duration::from_millis(20),
            },
        );
        let err = runner.run(&Stuck).await.unwrap_err();
        assert!(err.to_string().contains("hard time limit"));
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_while_running() {
        let runner = Arc::new(JobRunner::new(
            fast_policy(1),
            JobLimits {
                soft: Duration::from_millis(50),
                hard: Duration::from_secs(5),
            },
        ));
        let first = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(&Sleeper).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(runner.is_running("sleeper"));
        assert_eq!(
            runner.run(&Sleeper).await.unwrap_err(),
            JobError::Duplicate("sleeper".into())
        );
        assert!(first.await.unwrap().is_ok());
    }
}
