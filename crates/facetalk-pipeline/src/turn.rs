//! Turn pipeline: drives one conversational turn through the stage adapters.
//!
//! Every stage call is raced against the session's cancellation token and a
//! per-stage deadline. Adapter errors never escape: they become a failed
//! turn and exactly one `error` event. A cancelled turn emits nothing.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use facetalk_core::config::Config;
use facetalk_core::error::TurnErrorKind;
use facetalk_core::protocol::{OutboundEvent, StatusStage};
use facetalk_core::session::{ChatMessage, Turn, TurnInput, TurnPhase};
use facetalk_stages::{
    AudioArtifact, AudioInput, AvatarImage, StageContext, Stages, VideoArtifact,
};

use crate::cache::{ArtifactCache, NewArtifact, RecordOutcome};
use crate::metrics;
use crate::registry::LiveSession;

/// Why a turn stopped before delivering.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TurnFailure {
    #[error("{kind}: {message}")]
    Failed {
        kind: TurnErrorKind,
        message: String,
    },

    #[error("turn cancelled")]
    Cancelled,
}

impl TurnFailure {
    fn failed(kind: TurnErrorKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }
}

/// Render progress reported to the caller of [`TurnPipeline::render`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStep {
    Synthesizing,
    Animating,
    Delivering,
}

/// Result of the synthesize/animate/deliver path.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub video_url: String,
    pub cached: bool,
    pub audio_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub stage_timeout: Duration,
    pub scratch_root: Option<PathBuf>,
    pub history_limit: usize,
    pub video_prefix: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(60),
            scratch_root: None,
            history_limit: 40,
            video_prefix: "videos".into(),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stage_timeout: config.stage_timeout(),
            scratch_root: config.scratch_dir(),
            history_limit: config.history_limit(),
            video_prefix: config.video_prefix(),
        }
    }
}

pub struct TurnPipeline {
    stages: Stages,
    cache: Arc<ArtifactCache>,
    settings: PipelineSettings,
}

/// Keep the most recent `limit` messages, starting on a user message. The
/// newest message always survives.
fn trim_history(mut history: Vec<ChatMessage>, limit: usize) -> Vec<ChatMessage> {
    let limit = limit.max(1);
    if history.len() > limit {
        history.drain(..history.len() - limit);
    }
    let leading = history
        .iter()
        .take_while(|m| m.role != facetalk_core::session::Role::User)
        .count();
    history.drain(..leading);
    history
}

/// Path-safe form of a client-chosen session id for use in storage keys.
fn key_segment(session_id: &str) -> String {
    let segment: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if segment.is_empty() {
        "_".to_string()
    } else {
        segment
    }
}

fn storage_key(prefix: &str, session_id: &str) -> String {
    format!(
        "{}/{}/{}-{}.mp4",
        prefix,
        key_segment(session_id),
        chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

/// Deletes an uploaded blob on drop unless disarmed.
struct BlobCleanup<'a> {
    pipeline: &'a TurnPipeline,
    key: Option<String>,
}

impl BlobCleanup<'_> {
    fn disarm(mut self) {
        self.key = None;
    }
}

impl Drop for BlobCleanup<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.pipeline.delete_blob(key);
        }
    }
}

impl TurnPipeline {
    pub fn new(stages: Stages, cache: Arc<ArtifactCache>, settings: PipelineSettings) -> Self {
        Self {
            stages,
            cache,
            settings,
        }
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn stages(&self) -> &Stages {
        &self.stages
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Create the turn-scoped scratch directory.
    pub fn scratch_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("facetalk-turn-");
        match &self.settings.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }

    /// Run one stage call under the cancellation token and stage deadline.
    async fn call<T>(
        &self,
        ctx: &StageContext,
        stage: &'static str,
        kind: TurnErrorKind,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, TurnFailure> {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(TurnFailure::Cancelled),
            res = tokio::time::timeout(self.settings.stage_timeout, fut) => res,
        };
        metrics::record_stage(stage, started.elapsed());

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(session_id = %ctx.session_id, stage, error = %format!("{e:#}"), "Stage failed");
                Err(TurnFailure::failed(kind, format!("{stage} failed: {e}")))
            }
            Err(_) => {
                warn!(session_id = %ctx.session_id, stage, "Stage timed out");
                Err(TurnFailure::failed(
                    kind,
                    format!("{stage} timed out after {:?}", self.settings.stage_timeout),
                ))
            }
        }
    }

    /// Drive one turn for `live` to completion. `avatar_id` is the avatar
    /// bound when the turn was accepted.
    pub async fn run(&self, live: Arc<LiveSession>, input: TurnInput, avatar_id: Option<String>) {
        let mut turn = Turn::new(input);

        let scratch = match self.scratch_dir() {
            Ok(dir) => dir,
            Err(e) => {
                warn!(session_id = %live.id(), error = %e, "Failed to create scratch directory");
                let failure = TurnFailure::failed(
                    TurnErrorKind::StorageFailed,
                    "Could not allocate working storage for this turn",
                );
                self.conclude(&live, turn, Err(failure));
                return;
            }
        };
        let ctx = StageContext {
            session_id: live.id().to_string(),
            cancel: live.cancel_token(),
            scratch_dir: scratch.path().to_path_buf(),
        };

        let outcome = self.execute(&live, &mut turn, avatar_id.as_deref(), &ctx).await;
        // Scratch files go before the final event, on every exit path.
        drop(scratch);
        self.conclude(&live, turn, outcome);
    }

    fn conclude(&self, live: &LiveSession, mut turn: Turn, outcome: Result<Rendered, TurnFailure>) {
        match outcome {
            Ok(rendered) => {
                info!(
                    session_id = %live.id(),
                    cached = rendered.cached,
                    "Turn delivered"
                );
                metrics::record_turn("delivered");
                let event = OutboundEvent::Video {
                    video_url: rendered.video_url.clone(),
                    text: turn.reply.clone().unwrap_or_default(),
                };
                turn.video_url = Some(rendered.video_url);
                turn.cached = rendered.cached;
                turn.audio_ref = rendered.audio_ref;
                live.finish_turn(&turn, Some(event));
            }
            Err(TurnFailure::Failed { kind, message }) => {
                info!(session_id = %live.id(), kind = kind.as_str(), "Turn failed");
                metrics::record_turn(kind.as_str());
                turn.fail(kind, message.clone());
                live.finish_turn(&turn, Some(OutboundEvent::turn_error(kind, message)));
            }
            Err(TurnFailure::Cancelled) => {
                debug!(session_id = %live.id(), "Turn cancelled");
                metrics::record_turn("cancelled");
            }
        }
    }

    async fn execute(
        &self,
        live: &LiveSession,
        turn: &mut Turn,
        avatar_id: Option<&str>,
        ctx: &StageContext,
    ) -> Result<Rendered, TurnFailure> {
        let utterance = match turn.input.clone() {
            TurnInput::Text { content } => content.trim().to_string(),
            TurnInput::Audio { data, encoding } => {
                live.advance(turn, TurnPhase::Transcribing);
                live.emit(OutboundEvent::status(StatusStage::Transcription));

                let audio = AudioInput { data, encoding };
                let text = self
                    .call(
                        ctx,
                        "transcription",
                        TurnErrorKind::TranscriptionFailed,
                        self.stages.transcriber.transcribe(&audio, ctx),
                    )
                    .await?;
                let text = text.trim().to_string();
                if text.is_empty() {
                    return Err(TurnFailure::failed(
                        TurnErrorKind::EmptyTranscription,
                        "Could not transcribe audio",
                    ));
                }
                live.emit(OutboundEvent::Transcription { text: text.clone() });
                text
            }
        };
        turn.utterance = Some(utterance.clone());

        live.advance(turn, TurnPhase::Understanding);
        live.emit(OutboundEvent::status(StatusStage::Llm));

        let mut history = live.history();
        history.push(ChatMessage::user(utterance));
        let history = trim_history(history, self.settings.history_limit);

        let reply = self
            .call(
                ctx,
                "llm",
                TurnErrorKind::GenerationFailed,
                self.stages.conversation.reply(&history, ctx),
            )
            .await?;
        turn.reply = Some(reply.clone());
        live.commit_turn(turn, self.settings.history_limit);
        live.emit(OutboundEvent::assistant_message(reply.clone()));

        let mut on_step = |step: RenderStep| match step {
            RenderStep::Synthesizing => {
                live.advance(turn, TurnPhase::Synthesizing);
                live.emit(OutboundEvent::status(StatusStage::Tts));
            }
            RenderStep::Animating => {
                live.advance(turn, TurnPhase::Animating);
                live.emit(OutboundEvent::status(StatusStage::Animation));
            }
            RenderStep::Delivering => live.advance(turn, TurnPhase::Delivering),
        };
        self.render(avatar_id, &reply, ctx, &mut on_step).await
    }

    /// Produce a video for `text` spoken by `avatar_id`: cache lookup, then
    /// synthesis, animation, upload, and cache record on a miss.
    ///
    /// Shared by live turns and background render jobs.
    pub async fn render(
        &self,
        avatar_id: Option<&str>,
        text: &str,
        ctx: &StageContext,
        on_step: &mut (dyn FnMut(RenderStep) + Send),
    ) -> Result<Rendered, TurnFailure> {
        if let Some(avatar) = avatar_id {
            let hit = self.cache.lookup(avatar, text);
            metrics::record_cache_lookup(hit.is_some());
            self.discard_evicted();
            if let Some(entry) = hit {
                let entry = self.cache.touch(&entry).unwrap_or(entry);
                debug!(
                    session_id = %ctx.session_id,
                    fingerprint = %entry.fingerprint,
                    access_count = entry.access_count,
                    "Cache hit"
                );
                on_step(RenderStep::Delivering);
                return Ok(Rendered {
                    video_url: entry.video_url,
                    cached: true,
                    audio_ref: None,
                });
            }
        }

        on_step(RenderStep::Synthesizing);
        let audio = self.synthesize(text, ctx).await?;

        let Some(avatar) = avatar_id else {
            return Err(TurnFailure::failed(
                TurnErrorKind::NoAvatarSelected,
                "No avatar selected",
            ));
        };

        on_step(RenderStep::Animating);
        let image = self.avatar_image(avatar).await?;
        let video = self.animate(&image, &audio, ctx).await?;

        on_step(RenderStep::Delivering);
        let video_url = self.deliver(avatar, text, &video, ctx).await?;

        Ok(Rendered {
            video_url,
            cached: false,
            audio_ref: Some(audio.path.display().to_string()),
        })
    }

    async fn synthesize(&self, text: &str, ctx: &StageContext) -> Result<AudioArtifact, TurnFailure> {
        self.call(
            ctx,
            "tts",
            TurnErrorKind::SynthesisFailed,
            self.stages.synthesizer.synthesize(text, ctx),
        )
        .await
    }

    async fn avatar_image(&self, avatar_id: &str) -> Result<AvatarImage, TurnFailure> {
        match self.stages.avatars.image(avatar_id).await {
            Ok(Some(image)) => Ok(image),
            Ok(None) => Err(TurnFailure::failed(
                TurnErrorKind::AnimationFailed,
                format!("Avatar image not found: {avatar_id}"),
            )),
            Err(e) => Err(TurnFailure::failed(
                TurnErrorKind::AnimationFailed,
                format!("Avatar lookup failed: {e}"),
            )),
        }
    }

    async fn animate(
        &self,
        image: &AvatarImage,
        audio: &AudioArtifact,
        ctx: &StageContext,
    ) -> Result<VideoArtifact, TurnFailure> {
        self.call(
            ctx,
            "animation",
            TurnErrorKind::AnimationFailed,
            self.stages.animator.animate(image, audio, ctx),
        )
        .await
    }

    /// Upload the rendered video and record it in the cache.
    async fn deliver(
        &self,
        avatar_id: &str,
        text: &str,
        video: &VideoArtifact,
        ctx: &StageContext,
    ) -> Result<String, TurnFailure> {
        let bytes = tokio::fs::read(&video.path).await.map_err(|e| {
            TurnFailure::failed(
                TurnErrorKind::StorageFailed,
                format!("Rendered video unreadable: {e}"),
            )
        })?;
        let size_bytes = bytes.len() as u64;
        let key = storage_key(&self.settings.video_prefix, &ctx.session_id);

        // An upload cut short by cancel or deadline may still have landed.
        let cleanup = BlobCleanup {
            pipeline: self,
            key: Some(key.clone()),
        };
        let url = self
            .call(
                ctx,
                "storage",
                TurnErrorKind::StorageFailed,
                self.stages.store.put(bytes, &key, "video/mp4"),
            )
            .await?;

        if ctx.cancel.is_cancelled() {
            return Err(TurnFailure::Cancelled);
        }

        let artifact = NewArtifact {
            video_url: url.clone(),
            storage_key: key.clone(),
            duration_secs: video.duration_secs,
            size_bytes,
        };
        let url = match self.cache.record(avatar_id, text, artifact) {
            RecordOutcome::Inserted(_) => {
                cleanup.disarm();
                url
            }
            RecordOutcome::Existing(existing) => {
                debug!(
                    session_id = %ctx.session_id,
                    fingerprint = %existing.fingerprint,
                    "Concurrent render already cached, discarding duplicate"
                );
                existing.video_url
            }
        };
        self.discard_evicted();
        Ok(url)
    }

    fn delete_blob(&self, key: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "No runtime to delete blob");
            return;
        };
        let store = self.stages.store.clone();
        runtime.spawn(async move {
            if let Err(e) = store.delete(&key).await {
                warn!(key = %key, error = %e, "Failed to delete blob");
            }
        });
    }

    /// Delete blobs of entries the cache has evicted.
    fn discard_evicted(&self) {
        for entry in self.cache.take_evicted() {
            debug!(fingerprint = %entry.fingerprint, "Evicting cached video");
            self.delete_blob(entry.storage_key);
        }
    }
}
