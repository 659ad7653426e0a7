//! Session wire protocol.
//!
//! Every frame is a JSON text message tagged by `type`. Inbound frames come
//! from the client, outbound events are produced by the session pipeline.

use serde::{Deserialize, Serialize};

use crate::error::TurnErrorKind;

/// Client -> server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Recorded speech, base64-encoded.
    Audio {
        #[serde(alias = "audio")]
        data: String,
        #[serde(default = "default_audio_encoding")]
        encoding: String,
    },

    /// Typed input; skips transcription.
    Text {
        #[serde(alias = "text")]
        content: String,
    },

    Ping {},

    /// Bind an avatar for subsequent turns.
    SelectAvatar { avatar_id: String },

    /// Explicitly end the session.
    End {},
}

fn default_audio_encoding() -> String {
    "webm".into()
}

impl InboundFrame {
    /// Whether this frame starts a new turn.
    pub fn is_turn_input(&self) -> bool {
        matches!(self, Self::Audio { .. } | Self::Text { .. })
    }
}

/// Pipeline stage reported in `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusStage {
    Transcription,
    Llm,
    Tts,
    Animation,
}

impl StatusStage {
    /// Human-readable progress message shown by clients.
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::Transcription => "Processing audio...",
            Self::Llm => "Thinking...",
            Self::Tts => "Generating speech...",
            Self::Animation => "Creating avatar animation...",
        }
    }
}

/// Server -> client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Status { stage: StatusStage, message: String },

    Transcription { text: String },

    Message { role: String, content: String },

    Video { video_url: String, text: String },

    Error { kind: String, message: String },

    Pong {},
}

impl OutboundEvent {
    pub fn status(stage: StatusStage) -> Self {
        Self::Status {
            stage,
            message: stage.default_message().to_string(),
        }
    }

    pub fn assistant_message(content: impl Into<String>) -> Self {
        Self::Message {
            role: "assistant".into(),
            content: content.into(),
        }
    }

    pub fn turn_error(kind: TurnErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    /// Event type tag, used for logging and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Transcription { .. } => "transcription",
            Self::Message { .. } => "message",
            Self::Video { .. } => "video",
            Self::Error { .. } => "error",
            Self::Pong {} => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_inbound_frames() {
        let audio: InboundFrame =
            serde_json::from_value(json!({"type": "audio", "data": "AAAA", "encoding": "wav"}))
                .unwrap();
        assert_eq!(
            audio,
            InboundFrame::Audio {
                data: "AAAA".into(),
                encoding: "wav".into()
            }
        );

        let text: InboundFrame =
            serde_json::from_value(json!({"type": "text", "content": "hello"})).unwrap();
        assert!(text.is_turn_input());

        let ping: InboundFrame = serde_json::from_value(json!({"type": "ping"})).unwrap();
        assert_eq!(ping, InboundFrame::Ping {});
        assert!(!ping.is_turn_input());
    }

    #[test]
    fn test_legacy_field_names() {
        let audio: InboundFrame =
            serde_json::from_value(json!({"type": "audio", "audio": "AAAA"})).unwrap();
        assert_eq!(
            audio,
            InboundFrame::Audio {
                data: "AAAA".into(),
                encoding: "webm".into()
            }
        );

        let text: InboundFrame =
            serde_json::from_value(json!({"type": "text", "text": "hi"})).unwrap();
        assert_eq!(text, InboundFrame::Text { content: "hi".into() });
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let res = serde_json::from_value::<InboundFrame>(json!({"type": "dance"}));
        assert!(res.is_err());
    }

    #[test]
    fn test_outbound_shapes() {
        let status = serde_json::to_value(OutboundEvent::status(StatusStage::Llm)).unwrap();
        assert_eq!(status["type"], "status");
        assert_eq!(status["stage"], "llm");
        assert_eq!(status["message"], "Thinking...");

        let msg = serde_json::to_value(OutboundEvent::assistant_message("hey")).unwrap();
        assert_eq!(msg, json!({"type": "message", "role": "assistant", "content": "hey"}));

        let err = serde_json::to_value(OutboundEvent::turn_error(
            TurnErrorKind::EmptyTranscription,
            "Could not transcribe audio",
        ))
        .unwrap();
        assert_eq!(err["kind"], "empty_transcription");

        let pong = serde_json::to_string(&OutboundEvent::Pong {}).unwrap();
        assert_eq!(pong, r#"{"type":"pong"}"#);
    }
}
