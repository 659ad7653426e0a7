//! WebSocket connection lifecycle: open the session, pump frames both ways,
//! tear the session down when either side goes away.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use facetalk_core::protocol::{InboundFrame, OutboundEvent};

use crate::state::GatewayState;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Serialize one event and send it as a text frame.
async fn send_event(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    event: &OutboundEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(%e, kind = event.kind(), "Failed to serialize event");
            Ok(())
        }
    }
}

/// Send an error event and close the socket before any session exists.
async fn refuse(mut ws_tx: SplitSink<WebSocket, Message>, kind: &str, message: String) {
    let _ = send_event(&mut ws_tx, &OutboundEvent::error(kind, message)).await;
    let _ = ws_tx.send(Message::Close(None)).await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_rejected(kind);
}

/// Handle one client connection bound to `session_id`.
pub async fn handle_ws_connection(
    state: Arc<GatewayState>,
    ws: WebSocket,
    session_id: String,
    avatar_id: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let active = match state.avatars.session_active(&session_id).await {
        Ok(active) => active,
        Err(e) => {
            warn!(session_id = %session_id, %e, "Session lookup failed");
            false
        }
    };
    if !active {
        info!(session_id = %session_id, "Session is not active, refusing connection");
        refuse(ws_tx, "session_inactive", format!("Session {session_id} is not active")).await;
        return;
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<OutboundEvent>();
    let live = match state.registry.open(&session_id, event_tx) {
        Ok(live) => live,
        Err(e) => {
            warn!(session_id = %session_id, %e, "Refusing connection");
            refuse(ws_tx, e.kind(), e.to_string()).await;
            return;
        }
    };
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    if avatar_id.is_some() {
        let _ = state.registry.bind_avatar(&session_id, avatar_id);
    }

    let ping_interval = state.config.ping_interval();
    let registry = state.registry.clone();
    let writer_live = live.clone();

    // Single writer: events leave in the order the pipeline queued them.
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = send_event(&mut ws_tx, &event).await {
                            debug!(session_id = %writer_live.id(), %e, "Send failed, closing session");
                            registry.detach(&writer_live);
                            break;
                        }
                    }
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        registry.detach(&writer_live);
                        break;
                    }
                }
            }
        }
    });

    let mut writer_finished = false;
    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            _ = &mut send_task => {
                writer_finished = true;
                break;
            }
        };

        match msg {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<InboundFrame>(&text) {
                Ok(frame) => {
                    if let Err(e) = state.registry.route(&session_id, frame) {
                        debug!(session_id = %session_id, %e, "Frame rejected");
                    }
                }
                Err(e) => {
                    debug!(session_id = %session_id, %e, "Invalid frame received");
                    live.emit(OutboundEvent::error(
                        "invalid_frame",
                        format!("Invalid frame: {e}"),
                    ));
                }
            },
            Some(Ok(Message::Binary(_))) => {
                live.emit(OutboundEvent::error(
                    "invalid_frame",
                    "Binary frames are not supported",
                ));
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!(session_id = %session_id, "Client closed connection");
                break;
            }
            Some(Err(e)) => {
                debug!(session_id = %session_id, %e, "WebSocket error");
                break;
            }
            Some(Ok(_)) => {}
        }
    }

    // The id may since belong to a newer connection.
    state.registry.detach(&live);

    if !writer_finished
        && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut send_task)
            .await
            .is_err()
    {
        send_task.abort();
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();
    info!(session_id = %session_id, "Connection closed");
}
