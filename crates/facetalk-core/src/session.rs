//! Session model: live conversation state, turns, and turn phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TurnErrorKind;

/// Phase of the turn pipeline.
///
/// Phases are strictly ordered; a turn only ever moves forward, except that
/// the session returns to `Idle` once a turn delivers or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    #[default]
    Idle,
    Transcribing,
    Understanding,
    Synthesizing,
    Animating,
    Delivering,
    Failed,
}

impl TurnPhase {
    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Transcribing => 1,
            Self::Understanding => 2,
            Self::Synthesizing => 3,
            Self::Animating => 4,
            Self::Delivering => 5,
            Self::Failed => 6,
        }
    }

    /// Whether a turn in this phase may move to `next`.
    pub fn can_advance_to(self, next: TurnPhase) -> bool {
        match (self, next) {
            (Self::Failed, _) | (Self::Idle, Self::Failed) => false,
            (_, Self::Failed) => true,
            (_, Self::Idle) => false,
            // Text input skips transcription, cache hits skip synthesis and animation.
            (from, to) => to.rank() > from.rank(),
        }
    }

    /// A turn is in flight in every phase except `Idle` and `Failed`.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Transcribing => "transcribing",
            Self::Understanding => "understanding",
            Self::Synthesizing => "synthesizing",
            Self::Animating => "animating",
            Self::Delivering => "delivering",
            Self::Failed => "failed",
        }
    }
}

/// Input that started a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnInput {
    Audio { data: Vec<u8>, encoding: String },
    Text { content: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message of the conversation history handed to the language model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnError {
    pub kind: TurnErrorKind,
    pub message: String,
}

/// One request/response exchange within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub input: TurnInput,
    pub utterance: Option<String>,
    pub reply: Option<String>,
    pub audio_ref: Option<String>,
    pub video_url: Option<String>,
    /// True when the video was served from the artifact cache.
    #[serde(default)]
    pub cached: bool,
    pub phase: TurnPhase,
    pub error: Option<TurnError>,
    pub started_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(input: TurnInput) -> Self {
        Self {
            input,
            utterance: None,
            reply: None,
            audio_ref: None,
            video_url: None,
            cached: false,
            phase: TurnPhase::Idle,
            error: None,
            started_at: Utc::now(),
        }
    }

    /// Move the turn forward. Returns false (and leaves the phase untouched)
    /// on an illegal transition.
    pub fn advance(&mut self, next: TurnPhase) -> bool {
        let legal = self.phase.can_advance_to(next);
        debug_assert!(legal, "illegal turn transition {:?} -> {:?}", self.phase, next);
        if !legal {
            return false;
        }
        self.phase = next;
        true
    }

    pub fn fail(&mut self, kind: TurnErrorKind, message: impl Into<String>) {
        if self.phase.can_advance_to(TurnPhase::Failed) {
            self.phase = TurnPhase::Failed;
        }
        self.error = Some(TurnError {
            kind,
            message: message.into(),
        });
    }

    /// Copy of the turn with recorded audio reduced to its encoding.
    pub fn without_audio(mut self) -> Self {
        if let TurnInput::Audio { data, .. } = &mut self.input {
            *data = Vec::new();
        }
        self
    }

    /// Whether the turn delivered a video.
    pub fn is_delivered(&self) -> bool {
        self.phase == TurnPhase::Delivering && self.video_url.is_some()
    }
}

/// One live conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub avatar_id: Option<String>,
    /// Committed turns in conversation order.
    pub turns: Vec<Turn>,
    pub phase: TurnPhase,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            avatar_id: None,
            turns: Vec::new(),
            phase: TurnPhase::Idle,
            created_at: Utc::now(),
        }
    }

    /// Conversation history derived from committed turns.
    pub fn history(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() * 2);
        for turn in &self.turns {
            if let (Some(utterance), Some(reply)) = (&turn.utterance, &turn.reply) {
                messages.push(ChatMessage::user(utterance.clone()));
                messages.push(ChatMessage::assistant(reply.clone()));
            }
        }
        messages
    }

    /// Append a turn once its utterance and reply are known, keeping at most
    /// `keep` turns. Raw audio is not retained.
    pub fn commit_turn(&mut self, turn: Turn, keep: usize) {
        self.turns.push(turn.without_audio());
        let keep = keep.max(1);
        if self.turns.len() > keep {
            let excess = self.turns.len() - keep;
            self.turns.drain(..excess);
        }
    }

    /// Replace the most recently committed turn with its final state.
    pub fn finalize_last_turn(&mut self, turn: &Turn) {
        if let Some(last) = self.turns.last_mut() {
            if last.started_at == turn.started_at && last.utterance == turn.utterance {
                *last = turn.clone().without_audio();
            }
        }
    }
}
