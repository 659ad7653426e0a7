//! Gateway integration tests: start a real gateway and talk to it over WS + HTTP.
//!
//! Run with: `cargo test -p facetalk-gateway --test integration`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use facetalk_core::config::Config;
use facetalk_core::session::ChatMessage;
use facetalk_pipeline::{ArtifactCache, PipelineSettings, SessionRegistry, TurnPipeline};
use facetalk_stages::{
    Animator, AudioArtifact, AudioInput, AvatarDirectory, AvatarImage, BlobStore, Conversation,
    SpeechSynthesizer, StageContext, Stages, Transcriber, VideoArtifact,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct StubTranscriber;

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(&self, _audio: &AudioInput, _ctx: &StageContext) -> anyhow::Result<String> {
        Ok("spoken words".into())
    }
}

struct StubConversation;

#[async_trait]
impl Conversation for StubConversation {
    async fn reply(&self, history: &[ChatMessage], _ctx: &StageContext) -> anyhow::Result<String> {
        let last = history.last().map(|m| m.content.as_str()).unwrap_or_default();
        Ok(format!("Echo: {last}"))
    }
}

struct StubSynth;

#[async_trait]
impl SpeechSynthesizer for StubSynth {
    async fn synthesize(&self, text: &str, ctx: &StageContext) -> anyhow::Result<AudioArtifact> {
        let path = ctx.scratch_dir.join("speech.mp3");
        tokio::fs::write(&path, text.as_bytes()).await?;
        Ok(AudioArtifact {
            path,
            duration_secs: None,
        })
    }
}

struct StubAnimator;

#[async_trait]
impl Animator for StubAnimator {
    async fn animate(
        &self,
        _avatar: &AvatarImage,
        _audio: &AudioArtifact,
        ctx: &StageContext,
    ) -> anyhow::Result<VideoArtifact> {
        let path = ctx.scratch_dir.join("video.mp4");
        tokio::fs::write(&path, b"mp4").await?;
        Ok(VideoArtifact {
            path,
            duration_secs: 1.0,
        })
    }
}

struct NullStore;

#[async_trait]
impl BlobStore for NullStore {
    async fn put(&self, _bytes: Vec<u8>, key: &str, _content_type: &str) -> anyhow::Result<String> {
        Ok(format!("http://media.test/{key}"))
    }

    async fn delete(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Knows avatar `alice`; sessions prefixed `closed-` are inactive.
struct StubAvatars;

#[async_trait]
impl AvatarDirectory for StubAvatars {
    async fn image(&self, avatar_id: &str) -> anyhow::Result<Option<AvatarImage>> {
        Ok((avatar_id == "alice").then(|| AvatarImage {
            avatar_id: avatar_id.into(),
            path: PathBuf::from("/avatars/alice.png"),
        }))
    }

    async fn session_active(&self, session_id: &str) -> anyhow::Result<bool> {
        Ok(!session_id.starts_with("closed-"))
    }
}

struct TestGateway {
    state: Arc<facetalk_gateway::GatewayState>,
    port: u16,
    _scratch: tempfile::TempDir,
}

async fn start_test_gateway() -> TestGateway {
    let scratch = tempfile::tempdir().unwrap();
    let stages = Stages {
        transcriber: Arc::new(StubTranscriber),
        conversation: Arc::new(StubConversation),
        synthesizer: Arc::new(StubSynth),
        animator: Arc::new(StubAnimator),
        store: Arc::new(NullStore),
        avatars: Arc::new(StubAvatars),
    };
    let settings = PipelineSettings {
        scratch_root: Some(scratch.path().to_path_buf()),
        ..PipelineSettings::default()
    };
    let pipeline = Arc::new(TurnPipeline::new(
        stages,
        Arc::new(ArtifactCache::new(16, None)),
        settings,
    ));
    let registry = Arc::new(SessionRegistry::new(pipeline));
    let state = Arc::new(facetalk_gateway::GatewayState::new(
        Arc::new(Config::default()),
        registry,
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ =
            facetalk_gateway::serve(state_clone, listener, std::future::pending::<()>()).await;
    });

    for _ in 0..50 {
        if reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .is_ok()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    TestGateway {
        state,
        port,
        _scratch: scratch,
    }
}

async fn connect(port: u16, path: &str) -> Socket {
    let url = format!("ws://127.0.0.1:{port}{path}");
    let (ws, _) = connect_async(&url).await.expect("WS connect failed");
    ws
}

async fn send(ws: &mut Socket, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next JSON event, skipping control frames.
async fn next_event(ws: &mut Socket) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for event")?;
        match msg.ok()? {
            Message::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn wait_for_session(state: &facetalk_gateway::GatewayState, id: &str) {
    for _ in 0..50 {
        if state.registry.contains(id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session {id} never registered");
}

#[tokio::test]
async fn test_health_endpoint() {
    let gw = start_test_gateway().await;

    let resp = reqwest::get(format!("http://127.0.0.1:{}/health", gw.port))
        .await
        .expect("Health request failed");

    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["cache"]["entries"], 0);
}

#[tokio::test]
async fn test_ping_pong() {
    let gw = start_test_gateway().await;
    let mut ws = connect(gw.port, "/ws/session/s-ping").await;

    send(&mut ws, json!({"type": "ping"})).await;
    let event = next_event(&mut ws).await.unwrap();
    assert_eq!(event["type"], "pong");
}

#[tokio::test]
async fn test_text_turn_reaches_video() {
    let gw = start_test_gateway().await;
    let mut ws = connect(gw.port, "/ws/session/s-text?avatar_id=alice").await;

    send(&mut ws, json!({"type": "text", "content": "hi there"})).await;

    let mut kinds = Vec::new();
    let video = loop {
        let event = next_event(&mut ws).await.expect("connection closed early");
        kinds.push(event["type"].as_str().unwrap_or_default().to_string());
        if event["type"] == "video" || event["type"] == "error" {
            break event;
        }
    };

    assert_eq!(video["type"], "video", "events: {kinds:?}");
    assert_eq!(video["text"], "Echo: hi there");
    assert!(video["video_url"].as_str().unwrap().starts_with("http://media.test/"));
    assert_eq!(
        kinds,
        ["status", "message", "status", "status", "video"],
        "unexpected event order"
    );
}

#[tokio::test]
async fn test_duplicate_session_is_refused() {
    let gw = start_test_gateway().await;
    let mut first = connect(gw.port, "/ws/session/s-dup").await;
    wait_for_session(&gw.state, "s-dup").await;

    let mut second = connect(gw.port, "/ws/session/s-dup").await;
    let event = next_event(&mut second).await.unwrap();
    assert_eq!(event["type"], "error");
    assert_eq!(event["kind"], "duplicate_session");
    assert!(next_event(&mut second).await.is_none());

    // The original connection is unaffected.
    send(&mut first, json!({"type": "ping"})).await;
    assert_eq!(next_event(&mut first).await.unwrap()["type"], "pong");
    assert!(gw.state.registry.contains("s-dup"));
}

#[tokio::test]
async fn test_inactive_session_is_refused() {
    let gw = start_test_gateway().await;
    let mut ws = connect(gw.port, "/ws/session/closed-1").await;

    let event = next_event(&mut ws).await.unwrap();
    assert_eq!(event["kind"], "session_inactive");
    assert!(next_event(&mut ws).await.is_none());
    assert!(!gw.state.registry.contains("closed-1"));
}

#[tokio::test]
async fn test_invalid_frame_keeps_connection_open() {
    let gw = start_test_gateway().await;
    let mut ws = connect(gw.port, "/ws/session/s-bad").await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    let event = next_event(&mut ws).await.unwrap();
    assert_eq!(event["type"], "error");
    assert_eq!(event["kind"], "invalid_frame");

    send(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(next_event(&mut ws).await.unwrap()["type"], "pong");
}

#[tokio::test]
async fn test_disconnect_removes_session() {
    let gw = start_test_gateway().await;
    let mut ws = connect(gw.port, "/ws/session/s-gone").await;
    wait_for_session(&gw.state, "s-gone").await;

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if !gw.state.registry.contains("s-gone") {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session was not removed after disconnect");
}

#[tokio::test]
async fn test_end_frame_closes_socket() {
    let gw = start_test_gateway().await;
    let mut ws = connect(gw.port, "/ws/session/s-end").await;

    send(&mut ws, json!({"type": "end"})).await;
    assert!(next_event(&mut ws).await.is_none());
    assert!(!gw.state.registry.contains("s-end"));
}

#[tokio::test]
async fn test_prewarm_fills_cache() {
    let gw = start_test_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://127.0.0.1:{}/prewarm", gw.port))
        .json(&json!({"avatar_id": "alice", "texts": ["Welcome!", "Welcome!", " "]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"].as_array().unwrap().len(), 1);

    for _ in 0..100 {
        let health: Value = reqwest::get(format!("http://127.0.0.1:{}/health", gw.port))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if health["cache"]["entries"] == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pre-rendered video never reached the cache");
}
