//! Speech-to-text over a Whisper-compatible HTTP API.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use facetalk_core::config::TranscriptionConfig;

use crate::{AudioInput, StageContext, Transcriber};

/// Wrap raw 16-bit PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[i16], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_len = pcm.len() * 2;
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let file_size = 36 + data_len as u32;

    let mut wav = Vec::with_capacity(44 + data_len);

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&file_size.to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &sample in pcm {
        wav.extend_from_slice(&sample.to_le_bytes());
    }

    wav
}

/// Transcription endpoint for a provider.
pub fn provider_url(config: &TranscriptionConfig) -> &'static str {
    match config.provider.as_str() {
        "openai" => "https://api.openai.com/v1/audio/transcriptions",
        _ => "https://api.groq.com/openai/v1/audio/transcriptions",
    }
}

/// File name and MIME type for an uploaded clip, plus the bytes to send.
///
/// `pcm16` input is little-endian 16 kHz mono and gets a WAV header.
pub fn prepare_upload(audio: &AudioInput) -> (Vec<u8>, String, &'static str) {
    match audio.encoding.as_str() {
        "pcm16" | "pcm" => {
            let samples: Vec<i16> = audio
                .data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            (pcm_to_wav(&samples, 16000, 1, 16), "audio.wav".into(), "audio/wav")
        }
        other => {
            let mime = match other {
                "wav" => "audio/wav",
                "mp3" | "mpeg" => "audio/mpeg",
                "ogg" => "audio/ogg",
                "m4a" | "mp4" => "audio/mp4",
                "flac" => "audio/flac",
                _ => "audio/webm",
            };
            let ext = if mime == "audio/webm" { "webm" } else { other };
            (audio.data.clone(), format!("audio.{ext}"), mime)
        }
    }
}

/// Whisper transcription via Groq or OpenAI.
pub struct WhisperTranscriber {
    config: Option<TranscriptionConfig>,
    client: reqwest::Client,
}

impl WhisperTranscriber {
    pub fn new(config: Option<TranscriptionConfig>, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &AudioInput, ctx: &StageContext) -> Result<String> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Transcription is not configured"))?;
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;

        let (bytes, file_name, mime) = prepare_upload(audio);
        let url = provider_url(config);
        let model = config.model.as_deref().unwrap_or("whisper-large-v3-turbo");

        debug!(
            session_id = %ctx.session_id,
            url,
            model,
            bytes = bytes.len(),
            "Sending audio for transcription"
        );

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)?;

        let mut form = reqwest::multipart::Form::new()
            .text("model", model.to_string())
            .text("response_format", "text")
            .part("file", part);
        if let Some(lang) = &config.language {
            form = form.text("language", lang.clone());
        }

        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {api_key}"))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Transcription API error {status}: {body}");
        }

        let text = resp.text().await?;
        Ok(text.trim().to_string())
    }
}
