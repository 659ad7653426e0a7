//! ElevenLabs speech synthesis, streamed straight into the turn's scratch directory.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use facetalk_core::config::TtsConfig;

use crate::{AudioArtifact, SpeechSynthesizer, StageContext};

const DEFAULT_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";
const DEFAULT_MODEL: &str = "eleven_turbo_v2";
const DEFAULT_FORMAT: &str = "mp3_44100_128";

/// Build the ElevenLabs streaming TTS request URL.
pub fn build_tts_url(voice: &str, output_format: &str) -> String {
    format!(
        "https://api.elevenlabs.io/v1/text-to-speech/{voice}/stream?output_format={output_format}"
    )
}

/// File extension matching an ElevenLabs output format.
fn extension_for(output_format: &str) -> &'static str {
    if output_format.starts_with("pcm") {
        "pcm"
    } else if output_format.starts_with("ulaw") {
        "ulaw"
    } else {
        "mp3"
    }
}

pub struct ElevenLabsSynthesizer {
    config: Option<TtsConfig>,
    client: reqwest::Client,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: Option<TtsConfig>, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str, ctx: &StageContext) -> Result<AudioArtifact> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("TTS is not configured"))?;
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;

        let voice = config.default_voice.as_deref().unwrap_or(DEFAULT_VOICE);
        let model = config.default_model.as_deref().unwrap_or(DEFAULT_MODEL);
        let format = config.output_format.as_deref().unwrap_or(DEFAULT_FORMAT);

        debug!(session_id = %ctx.session_id, voice, model, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(build_tts_url(voice, format))
            .header("xi-api-key", &api_key)
            .json(&serde_json::json!({
                "text": text,
                "model_id": model,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let path = ctx.scratch_dir.join(format!("speech.{}", extension_for(format)));
        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0usize;

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| anyhow::anyhow!("TTS stream error: {e}"))?;
            written += bytes.len();
            file.write_all(&bytes).await?;
        }
        file.flush().await?;

        if written == 0 {
            anyhow::bail!("TTS returned no audio");
        }

        Ok(AudioArtifact {
            path,
            duration_secs: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_construction() {
        let url = build_tts_url("Rachel", "mp3_44100_128");
        assert!(url.contains("Rachel"));
        assert!(url.contains("/stream?output_format=mp3_44100_128"));
        assert!(url.starts_with("https://api.elevenlabs.io"));
    }

    #[test]
    fn test_extension_for_format() {
        assert_eq!(extension_for("mp3_22050_32"), "mp3");
        assert_eq!(extension_for("pcm_16000"), "pcm");
        assert_eq!(extension_for("ulaw_8000"), "ulaw");
    }
}
