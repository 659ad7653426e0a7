//! Stage adapters for the turn pipeline.
//!
//! Each external capability (transcribe, converse, synthesize, animate,
//! store) sits behind a trait so the pipeline never depends on a specific
//! provider. Adapters hold no session state and are safe to call
//! concurrently from many turns.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use facetalk_core::config::Config;
use facetalk_core::session::ChatMessage;

pub mod animator;
pub mod avatars;
pub mod llm;
pub mod storage;
pub mod stt;
pub mod tts;

/// Per-call context handed to every adapter.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub session_id: String,
    /// Fires when the owning session closes.
    pub cancel: CancellationToken,
    /// Turn-scoped scratch directory, removed when the turn ends.
    pub scratch_dir: PathBuf,
}

/// Recorded speech handed to the transcription stage.
#[derive(Debug, Clone)]
pub struct AudioInput {
    pub data: Vec<u8>,
    /// Container or sample format, e.g. "webm", "wav", "pcm16".
    pub encoding: String,
}

/// Synthesized speech on disk.
#[derive(Debug, Clone)]
pub struct AudioArtifact {
    pub path: PathBuf,
    pub duration_secs: Option<f64>,
}

/// Rendered talking-head video on disk.
#[derive(Debug, Clone)]
pub struct VideoArtifact {
    pub path: PathBuf,
    pub duration_secs: f64,
}

/// Processed reference image for an avatar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarImage {
    pub avatar_id: String,
    pub path: PathBuf,
}

/// Speech-to-text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &AudioInput, ctx: &StageContext) -> anyhow::Result<String>;
}

/// Language-model reply generation.
#[async_trait]
pub trait Conversation: Send + Sync {
    /// Generate a reply. `history` ends with the new user message.
    async fn reply(&self, history: &[ChatMessage], ctx: &StageContext) -> anyhow::Result<String>;
}

/// Text-to-speech.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, ctx: &StageContext) -> anyhow::Result<AudioArtifact>;
}

/// Face animation from a still image and an audio track.
#[async_trait]
pub trait Animator: Send + Sync {
    async fn animate(
        &self,
        avatar: &AvatarImage,
        audio: &AudioArtifact,
        ctx: &StageContext,
    ) -> anyhow::Result<VideoArtifact>;
}

/// Durable storage for rendered artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` and return a retrievable URL.
    async fn put(&self, bytes: Vec<u8>, key: &str, content_type: &str) -> anyhow::Result<String>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Read-only view of avatars and session state owned by the persistence layer.
#[async_trait]
pub trait AvatarDirectory: Send + Sync {
    async fn image(&self, avatar_id: &str) -> anyhow::Result<Option<AvatarImage>>;

    async fn session_active(&self, session_id: &str) -> anyhow::Result<bool>;
}

/// The full adapter set used by the pipeline.
#[derive(Clone)]
pub struct Stages {
    pub transcriber: Arc<dyn Transcriber>,
    pub conversation: Arc<dyn Conversation>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub animator: Arc<dyn Animator>,
    pub store: Arc<dyn BlobStore>,
    pub avatars: Arc<dyn AvatarDirectory>,
}

impl Stages {
    /// Build the configured concrete adapters.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            transcriber: Arc::new(stt::WhisperTranscriber::new(
                config.transcription.clone(),
                client.clone(),
            )),
            conversation: llm::build_conversation(config.llm.clone(), client.clone())?,
            synthesizer: Arc::new(tts::ElevenLabsSynthesizer::new(config.tts.clone(), client)),
            animator: Arc::new(animator::FfmpegAnimator::new(
                config.animation.clone().unwrap_or_default(),
            )),
            store: Arc::new(storage::LocalBlobStore::new(
                config.storage_dir(),
                config.storage_public_base_url(),
            )),
            avatars: Arc::new(avatars::FsAvatarDirectory::new(config.avatars_dir())),
        })
    }
}
