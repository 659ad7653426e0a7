//! Session registry: owns live sessions and enforces one turn at a time.
//!
//! Sessions live in a sharded map; each session guards its own state with a
//! short-lived mutex that is never held across a stage call.

use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use facetalk_core::protocol::{InboundFrame, OutboundEvent};
use facetalk_core::session::{ChatMessage, Session, Turn, TurnInput, TurnPhase};

use crate::turn::TurnPipeline;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Session already open: {0}")]
    DuplicateSession(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("A turn is already in progress for session {0}")]
    TurnInProgress(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl RegistryError {
    /// Stable kind string used in `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateSession(_) => "duplicate_session",
            Self::UnknownSession(_) => "unknown_session",
            Self::TurnInProgress(_) => "turn_in_progress",
            Self::InvalidFrame(_) => "invalid_frame",
        }
    }
}

/// Outbound half of a session's connection. Once closed, emits are dropped.
pub struct EventSink {
    tx: Mutex<Option<mpsc::UnboundedSender<OutboundEvent>>>,
}

impl EventSink {
    fn new(tx: mpsc::UnboundedSender<OutboundEvent>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<OutboundEvent>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an event. Returns false if the sink is closed or the receiver is gone.
    pub fn emit(&self, event: OutboundEvent) -> bool {
        match self.sender().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        self.sender().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender().as_ref().is_none_or(|tx| tx.is_closed())
    }
}

/// A registered session plus its connection handle and cancellation token.
pub struct LiveSession {
    id: String,
    state: Mutex<Session>,
    sink: EventSink,
    cancel: CancellationToken,
}

impl LiveSession {
    fn new(id: &str, tx: mpsc::UnboundedSender<OutboundEvent>) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(Session::new(id)),
            sink: EventSink::new(tx),
            cancel: CancellationToken::new(),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn emit(&self, event: OutboundEvent) -> bool {
        self.sink.emit(event)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn phase(&self) -> TurnPhase {
        self.session().phase
    }

    pub fn avatar(&self) -> Option<String> {
        self.session().avatar_id.clone()
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.session().history()
    }

    /// Copy of the session state.
    pub fn snapshot(&self) -> Session {
        self.session().clone()
    }

    fn bind_avatar(&self, avatar_id: Option<String>) {
        self.session().avatar_id = avatar_id;
    }

    /// Claim the session for a new turn. Returns the avatar bound at this instant.
    fn begin_turn(&self, input: &TurnInput) -> Result<Option<String>, RegistryError> {
        let mut session = self.session();
        if session.phase.is_active() {
            return Err(RegistryError::TurnInProgress(self.id.clone()));
        }
        session.phase = match input {
            TurnInput::Audio { .. } => TurnPhase::Transcribing,
            TurnInput::Text { .. } => TurnPhase::Understanding,
        };
        Ok(session.avatar_id.clone())
    }

    pub(crate) fn advance(&self, turn: &mut Turn, phase: TurnPhase) {
        if turn.advance(phase) {
            self.session().phase = phase;
        }
    }

    pub(crate) fn commit_turn(&self, turn: &Turn, keep: usize) {
        self.session().commit_turn(turn.clone(), keep);
    }

    /// Record the final turn state, emit its last event, and return to `Idle`.
    ///
    /// Done under the session lock so a new turn cannot start before the
    /// closing event is queued.
    pub(crate) fn finish_turn(&self, turn: &Turn, event: Option<OutboundEvent>) {
        let mut session = self.session();
        if turn.reply.is_some() {
            session.finalize_last_turn(turn);
        }
        if let Some(event) = event {
            self.sink.emit(event);
        }
        if turn.is_delivered() {
            debug!(session_id = %self.id, cached = turn.cached, "Turn delivered");
        }
        session.phase = TurnPhase::Idle;
    }

    fn shut(&self) {
        self.cancel.cancel();
        self.sink.close();
    }
}

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<LiveSession>>,
    pipeline: Arc<TurnPipeline>,
}

/// Strip an optional `data:<mime>;base64,` prefix and decode.
fn decode_audio(data: &str) -> Result<Vec<u8>, RegistryError> {
    let payload = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| RegistryError::InvalidFrame(format!("audio is not valid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(RegistryError::InvalidFrame("audio is empty".into()));
    }
    Ok(bytes)
}

impl SessionRegistry {
    pub fn new(pipeline: Arc<TurnPipeline>) -> Self {
        Self {
            sessions: DashMap::new(),
            pipeline,
        }
    }

    pub fn pipeline(&self) -> &Arc<TurnPipeline> {
        &self.pipeline
    }

    /// Register a new session whose events flow into `tx`.
    pub fn open(
        &self,
        session_id: &str,
        tx: mpsc::UnboundedSender<OutboundEvent>,
    ) -> Result<Arc<LiveSession>, RegistryError> {
        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateSession(session_id.to_string())),
            Entry::Vacant(slot) => {
                let live = Arc::new(LiveSession::new(session_id, tx));
                slot.insert(live.clone());
                info!(session_id, "Session opened");
                Ok(live)
            }
        }
    }

    fn get(&self, session_id: &str) -> Result<Arc<LiveSession>, RegistryError> {
        self.sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))
    }

    /// Dispatch an inbound frame to its session.
    ///
    /// Rejections that the client should see (`TurnInProgress`,
    /// `InvalidFrame`) are also emitted as `error` events on the session.
    pub fn route(&self, session_id: &str, frame: InboundFrame) -> Result<(), RegistryError> {
        let live = self.get(session_id)?;
        if frame.is_turn_input() {
            debug!(session_id, phase = live.phase().as_str(), "Turn input received");
        }
        match frame {
            InboundFrame::Ping {} => {
                live.emit(OutboundEvent::Pong {});
                Ok(())
            }
            InboundFrame::Text { content } => {
                if content.trim().is_empty() {
                    return reject(&live, RegistryError::InvalidFrame("text is empty".into()));
                }
                self.start_turn(live, TurnInput::Text { content })
            }
            InboundFrame::Audio { data, encoding } => match decode_audio(&data) {
                Ok(bytes) => self.start_turn(
                    live,
                    TurnInput::Audio {
                        data: bytes,
                        encoding,
                    },
                ),
                Err(e) => reject(&live, e),
            },
            InboundFrame::SelectAvatar { avatar_id } => {
                self.bind_avatar(session_id, Some(avatar_id))
            }
            InboundFrame::End {} => {
                self.detach(&live);
                Ok(())
            }
        }
    }

    fn start_turn(&self, live: Arc<LiveSession>, input: TurnInput) -> Result<(), RegistryError> {
        let avatar_id = match live.begin_turn(&input) {
            Ok(avatar) => avatar,
            Err(e) => return reject(&live, e),
        };
        debug!(session_id = %live.id(), avatar_id = ?avatar_id, "Turn started");

        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            pipeline.run(live, input, avatar_id).await;
        });
        Ok(())
    }

    /// Bind (or clear) the avatar used by turns started after this call.
    pub fn bind_avatar(
        &self,
        session_id: &str,
        avatar_id: Option<String>,
    ) -> Result<(), RegistryError> {
        let live = self.get(session_id)?;
        debug!(session_id, avatar_id = ?avatar_id, "Avatar bound");
        live.bind_avatar(avatar_id);
        Ok(())
    }

    /// Tear down a session: cancel its in-flight turn and release the
    /// connection handle. Idempotent; returns whether a session was removed.
    ///
    /// No events for the session are emitted after this returns.
    pub fn close(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, live)) => {
                live.shut();
                info!(session_id, "Session closed");
                true
            }
            None => false,
        }
    }

    /// Close `live` only if it is still the session registered under its id.
    ///
    /// Connection tasks use this so a late teardown cannot remove a newer
    /// session that reused the id.
    pub fn detach(&self, live: &Arc<LiveSession>) -> bool {
        let removed = self
            .sessions
            .remove_if(live.id(), |_, current| Arc::ptr_eq(current, live))
            .is_some();
        live.shut();
        if removed {
            info!(session_id = %live.id(), "Session closed");
        }
        removed
    }

    /// Close every live session.
    pub fn shutdown_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn phase(&self, session_id: &str) -> Option<TurnPhase> {
        self.get(session_id).ok().map(|s| s.phase())
    }

    pub fn history(&self, session_id: &str) -> Option<Vec<ChatMessage>> {
        self.get(session_id).ok().map(|s| s.history())
    }

    pub fn snapshot(&self, session_id: &str) -> Option<Session> {
        self.get(session_id).ok().map(|s| s.snapshot())
    }
}

fn reject(live: &LiveSession, err: RegistryError) -> Result<(), RegistryError> {
    live.emit(OutboundEvent::error(err.kind(), err.to_string()));
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_audio() {
        assert_eq!(decode_audio("AQID").unwrap(), vec![1, 2, 3]);
        assert_eq!(
            decode_audio("data:audio/webm;base64,AQID").unwrap(),
            vec![1, 2, 3]
        );
        assert!(matches!(
            decode_audio("not base64!"),
            Err(RegistryError::InvalidFrame(_))
        ));
        assert!(decode_audio("").is_err());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            RegistryError::TurnInProgress("s".into()).kind(),
            "turn_in_progress"
        );
        assert_eq!(
            RegistryError::DuplicateSession("s".into()).kind(),
            "duplicate_session"
        );
    }

    #[test]
    fn test_sink_drops_after_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        assert!(sink.emit(OutboundEvent::Pong {}));
        sink.close();
        assert!(!sink.emit(OutboundEvent::Pong {}));
        assert!(sink.is_closed());
        assert_eq!(rx.try_recv().unwrap(), OutboundEvent::Pong {});
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_begin_turn_is_single_flight() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let live = LiveSession::new("s1", tx);
        let input = TurnInput::Text {
            content: "hi".into(),
        };
        assert!(live.begin_turn(&input).is_ok());
        assert_eq!(live.phase(), TurnPhase::Understanding);
        assert_eq!(
            live.begin_turn(&input),
            Err(RegistryError::TurnInProgress("s1".into()))
        );

        let turn = Turn::new(input.clone());
        live.finish_turn(&turn, None);
        assert_eq!(live.phase(), TurnPhase::Idle);
        assert!(live.begin_turn(&input).is_ok());
    }
}
