use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading shared configuration.
#[derive(Debug, Error)]
pub enum FacetalkError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FacetalkError>;

/// Why a turn ended in the `Failed` phase.
///
/// The serialized form is the stable kind string sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnErrorKind {
    EmptyTranscription,
    TranscriptionFailed,
    GenerationFailed,
    NoAvatarSelected,
    SynthesisFailed,
    AnimationFailed,
    StorageFailed,
}

impl TurnErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyTranscription => "empty_transcription",
            Self::TranscriptionFailed => "transcription_failed",
            Self::GenerationFailed => "generation_failed",
            Self::NoAvatarSelected => "no_avatar_selected",
            Self::SynthesisFailed => "synthesis_failed",
            Self::AnimationFailed => "animation_failed",
            Self::StorageFailed => "storage_failed",
        }
    }
}

impl std::fmt::Display for TurnErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_match_serde() {
        for kind in [
            TurnErrorKind::EmptyTranscription,
            TurnErrorKind::TranscriptionFailed,
            TurnErrorKind::GenerationFailed,
            TurnErrorKind::NoAvatarSelected,
            TurnErrorKind::SynthesisFailed,
            TurnErrorKind::AnimationFailed,
            TurnErrorKind::StorageFailed,
        ] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
    }
}
