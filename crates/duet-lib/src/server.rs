//! HTTP and websocket API.
//!
//! ```text
//! GET /health                          liveness and active providers
//! GET /providers                       registry catalog
//! GET /sessions                        connected sessions
//! GET /ws/chat/{conversation_id}?user= conversation socket
//! ```
//!
//! CORS-permissive so a browser client on another port can connect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use duet_core::protocol::{ClientFrame, ServerFrame};
use duet_core::types::ErrorScope;

use crate::config::Settings;
use crate::context::MemoryStore;
use crate::error::{PipelineError, PipelineResult};
use crate::ingest::AudioIngest;
use crate::mux::{EventMultiplexer, FrameSink, WireMessage};
use crate::pipeline::{PipelineCoordinator, TurnInput, TurnRequest};
use crate::registry::{ProviderCatalog, ProviderRegistry};
use crate::session::{SessionInfo, Sessions};

/// Interval between websocket pings on an idle or busy session.
const KEEPALIVE: Duration = Duration::from_secs(20);

/// User id for sockets opened without `?user=`.
const ANONYMOUS: &str = "anonymous";

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub settings: Settings,
    pub registry: ProviderRegistry,
    pub coordinator: PipelineCoordinator,
    pub sessions: Sessions,
    pub store: Arc<MemoryStore>,
}

impl AppState {
    /// Wire a coordinator over `registry` and an in-memory store seeded from
    /// `[[conversations]]`.
    pub fn new(settings: Settings, registry: ProviderRegistry) -> PipelineResult<Self> {
        let store = Arc::new(MemoryStore::new(&settings.conversations));
        let coordinator =
            PipelineCoordinator::new(&registry, &settings.pipeline, store.clone(), store.clone())?;
        Ok(Self {
            settings,
            registry,
            coordinator,
            sessions: Sessions::default(),
            store,
        })
    }

    /// Registry built from the `[providers.*]` sections.
    pub fn from_settings(settings: Settings) -> PipelineResult<Self> {
        let registry = ProviderRegistry::from_settings(&settings.providers);
        Self::new(settings, registry)
    }
}

/// Build the axum router over shared state.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/providers", get(providers))
        .route("/sessions", get(sessions))
        .route("/ws/chat/{conversation_id}", get(chat))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the configured address and serve until the process ends.
pub async fn serve(state: SharedState) -> PipelineResult<()> {
    let addr = format!("{}:{}", state.settings.server.host, state.settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("duet listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ─── REST ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    sessions: usize,
    stt: String,
    llm: String,
    tts: String,
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let pipeline = &state.settings.pipeline;
    Json(HealthResponse {
        ok: true,
        sessions: state.sessions.len(),
        stt: pipeline.stt.clone(),
        llm: pipeline.llm.clone(),
        tts: pipeline.tts.clone(),
    })
}

async fn providers(State(state): State<SharedState>) -> Json<ProviderCatalog> {
    Json(state.registry.catalog())
}

async fn sessions(State(state): State<SharedState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list())
}

// ─── Conversation socket ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatQuery {
    #[serde(default)]
    user: Option<String>,
}

async fn chat(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<String>,
    Query(query): Query<ChatQuery>,
    State(state): State<SharedState>,
) -> Response {
    let user_id = query
        .user
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| ANONYMOUS.to_string());
    ws.on_upgrade(move |socket| run_session(state, socket, conversation_id, user_id))
}

/// Write half of an axum socket.
struct SocketSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for SocketSink {
    async fn send(&mut self, message: WireMessage) -> PipelineResult<()> {
        let message = match message {
            WireMessage::Text(text) => Message::Text(text.into()),
            WireMessage::Binary(bytes) => Message::Binary(bytes.into()),
            WireMessage::Ping => Message::Ping(Vec::new().into()),
        };
        self.0
            .send(message)
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

/// One connected client.
struct Session {
    state: SharedState,
    id: Uuid,
    conversation_id: String,
    user_id: String,
    mux: EventMultiplexer,
    ingest: AudioIngest,
    turn: Option<JoinHandle<()>>,
}

impl Session {
    async fn handle_text(&mut self, text: &str) -> PipelineResult<()> {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("session {}: unreadable frame: {e}", self.id);
                return self
                    .reject(PipelineError::Validation(format!("unreadable frame: {e}")))
                    .await;
            }
        };
        match frame {
            ClientFrame::AudioStart {
                format,
                sample_rate,
            } => {
                if self.ingest.is_receiving() {
                    warn!("session {}: audio_start during a capture, earlier audio dropped", self.id);
                }
                self.ingest.start(format, sample_rate);
                Ok(())
            }
            ClientFrame::AudioEnd => match self.ingest.finish() {
                Ok(clip) => self.start_turn(TurnInput::Audio(clip)).await,
                Err(e) => self.reject(e).await,
            },
            ClientFrame::TextMessage { data } if data.message.trim().is_empty() => {
                self.reject(PipelineError::Validation("empty text message".into()))
                    .await
            }
            ClientFrame::TextMessage { data } => {
                self.start_turn(TurnInput::Text(data.message)).await
            }
            ClientFrame::Ping => self.mux.send_frame(&ServerFrame::pong()).await,
        }
    }

    async fn handle_binary(&mut self, bytes: Vec<u8>) -> PipelineResult<()> {
        match self.ingest.push(bytes) {
            Ok(_) => Ok(()),
            Err(e) => self.reject(e).await,
        }
    }

    async fn start_turn(&mut self, input: TurnInput) -> PipelineResult<()> {
        let Some(cancel) = self.state.sessions.begin_turn(self.id) else {
            return self
                .reject(PipelineError::Validation("a turn is already running".into()))
                .await;
        };
        let request = TurnRequest {
            conversation_id: self.conversation_id.clone(),
            user_id: self.user_id.clone(),
            input,
        };
        let state = self.state.clone();
        let mux = self.mux.clone();
        let session_id = self.id;
        self.turn = Some(tokio::spawn(async move {
            let turn = state.coordinator.run_turn(request, &mux, cancel).await;
            state.sessions.finish_turn(session_id, turn.summary());
        }));
        Ok(())
    }

    /// Tell the client a frame was refused; the session stays open.
    async fn reject(&self, err: PipelineError) -> PipelineResult<()> {
        warn!("session {}: {err}", self.id);
        self.mux
            .send_frame(&ServerFrame::error(ErrorScope::Turn, err.client_message()))
            .await
    }

    /// Cancel the running turn and give it `grace` to unwind before it is
    /// aborted.
    async fn shutdown(mut self, grace: Duration) {
        self.state.sessions.cancel(self.id);
        if let Some(mut turn) = self.turn.take() {
            if tokio::time::timeout(grace, &mut turn).await.is_err() {
                warn!("session {}: turn still running after {grace:?}, aborting", self.id);
                turn.abort();
            }
        }
        self.state.sessions.close(self.id);
        self.mux.close().await;
    }
}

async fn run_session(state: SharedState, socket: WebSocket, conversation_id: String, user_id: String) {
    let server = state.settings.server.clone();
    let (sink, mut inbound) = socket.split();
    let (mux, writer) = EventMultiplexer::spawn(SocketSink(sink), server.max_binary_frame);
    let id = state.sessions.open(&conversation_id, &user_id);
    info!("session {id}: opened for {conversation_id} by {user_id}");

    let mut session = Session {
        state,
        id,
        conversation_id,
        user_id,
        mux,
        ingest: AudioIngest::new(server.max_audio_bytes),
        turn: None,
    };
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + KEEPALIVE, KEEPALIVE);

    loop {
        let handled = tokio::select! {
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                Some(Ok(Message::Binary(bytes))) => session.handle_binary(bytes.to_vec()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => Ok(()),
                Some(Err(e)) => {
                    debug!("session {id}: read failed: {e}");
                    break;
                }
            },
            _ = keepalive.tick() => session.mux.ping().await,
        };
        if handled.is_err() {
            break;
        }
    }

    info!("session {id}: closed");
    session
        .shutdown(Duration::from_millis(server.cancel_grace_ms))
        .await;
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_server(settings: Settings) -> (String, SharedState) {
        let state = Arc::new(AppState::new(settings, ProviderRegistry::with_mocks()).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    #[tokio::test]
    async fn health_reports_active_providers() {
        let (base, _) = spawn_server(Settings::default()).await;
        let body: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["llm"], "mock");
    }

    #[tokio::test]
    async fn providers_lists_catalog() {
        let (base, _) = spawn_server(Settings::default()).await;
        let body: serde_json::Value = reqwest::get(format!("{base}/providers"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["stt"][0]["id"], "mock");
        assert_eq!(body["tts"][0]["available"], true);
    }

    #[tokio::test]
    async fn sessions_starts_empty() {
        let (base, state) = spawn_server(Settings::default()).await;
        state.sessions.open("c1", "alice");
        let body: serde_json::Value = reqwest::get(format!("{base}/sessions"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["conversationId"], "c1");
    }

    #[test]
    fn unknown_provider_fails_at_startup() {
        let mut settings = Settings::default();
        settings.pipeline.llm = "nope".into();
        assert!(matches!(
            AppState::from_settings(settings),
            Err(PipelineError::ProviderNotFound(_))
        ));
    }
}
